//! SSH-backed transport.
//!
//! Shells out to the system `ssh` in batch mode, the same way the rest of the
//! harness reaches its nodes. Tails run `tail -F -n 0` on the remote side so
//! only lines appended after the open are seen; the ssh child is killed when
//! the tail handle is dropped, so no session outlives its watch.

use std::process::Stdio;

use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::config::SshOptions;
use crate::errors::EngineError;
use crate::transport::{TAIL_CHANNEL_DEPTH, TailHandle, Transport};
use crate::types::NodeId;

/// `Transport` implementation over the system ssh binary.
#[derive(Debug, Clone)]
pub struct SshTransport {
    options: SshOptions,
}

impl SshTransport {
    pub fn new(options: SshOptions) -> Self {
        Self { options }
    }

    /// `user@host`, or the bare node id when no user is configured.
    fn destination(&self, node: &NodeId) -> String {
        match &self.options.user {
            Some(user) => format!("{user}@{node}"),
            None => node.as_str().to_string(),
        }
    }

    /// Common ssh arguments: batch mode, connect timeout, optional identity.
    fn base_args(&self) -> Vec<String> {
        let mut args = vec![
            "-o".to_string(),
            "BatchMode=yes".to_string(),
            "-o".to_string(),
            format!("ConnectTimeout={}", self.options.connect_timeout.as_secs()),
        ];
        if let Some(identity) = &self.options.identity_file {
            args.push("-i".to_string());
            args.push(identity.to_string_lossy().to_string());
        }
        args
    }

    /// Remote command for a live end-of-file tail.
    fn tail_command(path: &str) -> String {
        format!(
            "tail -F -n 0 -- {}",
            shell_escape::escape(path.into())
        )
    }
}

impl Transport for SshTransport {
    async fn tail(&self, node: &NodeId, path: &str) -> Result<TailHandle, EngineError> {
        let mut cmd = Command::new("ssh");
        cmd.args(self.base_args())
            .arg(self.destination(node))
            .arg(Self::tail_command(path))
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .kill_on_drop(true);

        debug!(node = %node, path, "opening remote tail");
        let mut child = cmd
            .spawn()
            .map_err(|e| EngineError::tail(node.as_str(), path, format!("spawn ssh: {e}")))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| EngineError::tail(node.as_str(), path, "no stdout from ssh"))?;

        let (tx, rx) = mpsc::channel(TAIL_CHANNEL_DEPTH);
        let node_name = node.as_str().to_string();
        let path_name = path.to_string();
        // The pump owns the child; aborting it drops (and kills) the ssh
        // session.
        let pump = tokio::spawn(async move {
            let _child = child;
            let mut lines = BufReader::new(stdout).lines();
            loop {
                match lines.next_line().await {
                    Ok(Some(line)) => {
                        if tx.send(Ok(line)).await.is_err() {
                            break;
                        }
                    }
                    Ok(None) => {
                        // The remote tail ended; for `tail -F` that means the
                        // connection is gone, not that the file is done.
                        let _ = tx
                            .send(Err(EngineError::tail(
                                &node_name,
                                &path_name,
                                "tail session ended",
                            )))
                            .await;
                        break;
                    }
                    Err(e) => {
                        let _ = tx
                            .send(Err(EngineError::tail(
                                &node_name,
                                &path_name,
                                e.to_string(),
                            )))
                            .await;
                        break;
                    }
                }
            }
        });

        Ok(TailHandle::new(rx, pump))
    }

    async fn exec(&self, node: &NodeId, command: &str) -> Result<(), EngineError> {
        let mut cmd = Command::new("ssh");
        cmd.args(self.base_args())
            .arg(self.destination(node))
            .arg(command)
            .stdin(Stdio::null());

        debug!(node = %node, command, "executing remote command");
        let output = cmd
            .output()
            .await
            .map_err(|e| EngineError::exec(node.as_str(), format!("spawn ssh: {e}")))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            warn!(node = %node, status = %output.status, "remote command failed");
            return Err(EngineError::exec(
                node.as_str(),
                format!("{}: {}", output.status, stderr.trim()),
            ));
        }
        Ok(())
    }
}
