//! Subprocess bridges: ordinary stages that happen to wrap an OS pipe to a
//! `/bin/sh -c` child.
//!
//! `Command` opens only the requested stdio pipes and every other inherited
//! descriptor is close-on-exec, so the child cannot hold pipeline plumbing
//! open. Failures go out of band through the caller's [`Status`].

use std::io::{BufRead, BufReader, Write};
use std::process::{Child, Command, Stdio};
use std::thread;

use crate::error::{StageFault, Status};
use crate::stage::{Flow, Nothing, Sink, Stage};

fn shell(cmd: &str) -> Command {
    let mut command = Command::new("/bin/sh");
    command.arg("-c").arg(cmd);
    command
}

fn reap(mut child: Child, cmd: &str, status: &Status) {
    match child.wait() {
        Ok(exit) if !exit.success() => status.record(StageFault::Exit {
            command: cmd.to_string(),
            status: exit,
        }),
        Ok(_) => {}
        Err(source) => status.record(StageFault::ChildIo {
            command: cmd.to_string(),
            source,
        }),
    }
}

/// Run a shell command and emit its stdout line by line.
pub fn exec_r(cmd: impl Into<String>, status: &Status) -> Stage<Nothing, String> {
    let cmd = cmd.into();
    let status = status.clone();
    Stage::source("exec_r", move |flow| {
        let mut child = match shell(&cmd)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .spawn()
        {
            Ok(child) => child,
            Err(source) => {
                status.record(StageFault::Spawn {
                    command: cmd.clone(),
                    source,
                });
                return;
            }
        };
        let stdout = child.stdout.take().expect("child stdout is piped");
        for line in BufReader::new(stdout).lines() {
            match line {
                Ok(line) => flow.put(line),
                Err(source) => {
                    status.record(StageFault::ChildIo {
                        command: cmd.clone(),
                        source,
                    });
                    break;
                }
            }
        }
        reap(child, &cmd, &status);
    })
}

/// Run a shell command and feed it the input, line by line, on stdin.
pub fn exec_w(cmd: impl Into<String>, status: &Status) -> Sink<String> {
    let cmd = cmd.into();
    let status = status.clone();
    Sink::new("exec_w", move |flow| {
        let mut child = match shell(&cmd).stdin(Stdio::piped()).spawn() {
            Ok(child) => child,
            Err(source) => {
                status.record(StageFault::Spawn {
                    command: cmd.clone(),
                    source,
                });
                return;
            }
        };
        let mut stdin = child.stdin.take().expect("child stdin is piped");
        while let Some(line) = flow.read() {
            if let Err(source) = writeln!(stdin, "{line}") {
                status.record(StageFault::ChildIo {
                    command: cmd.clone(),
                    source,
                });
                break;
            }
        }
        drop(stdin);
        reap(child, &cmd, &status);
    })
}

/// Run a shell command, feeding it the input on stdin while emitting its
/// stdout, concurrently.
pub fn exec_rw(cmd: impl Into<String>, status: &Status) -> Stage<String, String> {
    let cmd = cmd.into();
    let status = status.clone();
    Stage::new("exec_rw", move |flow: &mut Flow<String, String>| {
        let mut child = match shell(&cmd)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .spawn()
        {
            Ok(child) => child,
            Err(source) => {
                status.record(StageFault::Spawn {
                    command: cmd.clone(),
                    source,
                });
                return;
            }
        };
        let mut stdin = child.stdin.take().expect("child stdin is piped");
        let stdout = child.stdout.take().expect("child stdout is piped");

        // The child's stdout must drain while its stdin fills or a chatty
        // child would block both sides. The pump is the stream's only
        // producer; the body never puts.
        let out = flow.output_stream();
        let pump_status = status.clone();
        let pump_cmd = cmd.clone();
        let pump = thread::Builder::new()
            .name("exec_rw.stdout".to_string())
            .spawn(move || {
                for line in BufReader::new(stdout).lines() {
                    match line {
                        Ok(line) => out.write(line),
                        Err(source) => {
                            pump_status.record(StageFault::ChildIo {
                                command: pump_cmd.clone(),
                                source,
                            });
                            break;
                        }
                    }
                }
            })
            .expect("failed to spawn stage thread");

        while let Some(line) = flow.read() {
            if let Err(source) = writeln!(stdin, "{line}") {
                status.record(StageFault::ChildIo {
                    command: cmd.clone(),
                    source,
                });
                break;
            }
        }
        drop(stdin);
        let _ = pump.join();
        reap(child, &cmd, &status);
    })
}
