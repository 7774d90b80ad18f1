//! Configuration codec implementations.
//!
//! [`JsonCodec`] links the codec in-process for networks whose configuration
//! block carries the JSON form of [`ChannelConfig`]. [`CommandCodec`] delegates
//! to an external translator program and turns its exit status into
//! [`CodecError`] values.

use crate::channel::{ChannelConfig, ConfigUpdate};
use crate::collab::ConfigCodec;
use crate::error::CodecError;
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tokio::time;

/// In-process codec over canonical JSON.
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonCodec;

impl JsonCodec {
    /// Decodes update bytes produced by [`ConfigCodec::diff`].
    pub fn decode_update(bytes: &[u8]) -> Result<ConfigUpdate, CodecError> {
        serde_json::from_slice(bytes).map_err(|err| CodecError::Decode(err.to_string()))
    }

    fn decode_config(bytes: &[u8]) -> Result<ChannelConfig, CodecError> {
        serde_json::from_slice(bytes).map_err(|err| CodecError::Decode(err.to_string()))
    }

    fn encode_config(config: &ChannelConfig) -> Result<Vec<u8>, CodecError> {
        serde_json::to_vec(config).map_err(|err| CodecError::Encode(err.to_string()))
    }
}

#[async_trait]
impl ConfigCodec for JsonCodec {
    async fn decode(&self, bytes: &[u8]) -> Result<ChannelConfig, CodecError> {
        Self::decode_config(bytes)
    }

    async fn encode(&self, config: &ChannelConfig) -> Result<Vec<u8>, CodecError> {
        Self::encode_config(config)
    }

    async fn diff(&self, original: &[u8], proposed: &[u8]) -> Result<Vec<u8>, CodecError> {
        let original = Self::decode_config(original)?;
        let proposed = Self::decode_config(proposed)?;
        if original.channel != proposed.channel {
            return Err(CodecError::Diff(format!(
                "channel mismatch: {} vs {}",
                original.channel, proposed.channel
            )));
        }
        let update = ConfigUpdate::between(&original, &proposed);
        serde_json::to_vec(&update).map_err(|err| CodecError::Encode(err.to_string()))
    }
}

/// Out-of-process codec.
///
/// The program is invoked as `<program> decode` / `<program> encode` with the
/// input on stdin and the result on stdout, and as
/// `<program> diff <original> <proposed>` with both inputs staged as files.
#[derive(Debug, Clone)]
pub struct CommandCodec {
    program: PathBuf,
    timeout: Duration,
    scratch_dir: PathBuf,
}

impl CommandCodec {
    /// Codec backed by `program`, each invocation bounded by `timeout`.
    pub fn new(program: impl Into<PathBuf>, timeout: Duration) -> Self {
        Self {
            program: program.into(),
            timeout,
            scratch_dir: std::env::temp_dir(),
        }
    }

    /// Directory used to stage diff inputs.
    pub fn with_scratch_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.scratch_dir = dir.into();
        self
    }

    async fn run(&self, args: &[&str], input: Option<&[u8]>) -> Result<Vec<u8>, CodecError> {
        let program = self.program.display().to_string();
        let mut child = Command::new(&self.program)
            .args(args)
            .stdin(if input.is_some() {
                Stdio::piped()
            } else {
                Stdio::null()
            })
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|err| CodecError::Spawn(format!("{program}: {err}")))?;
        if let (Some(bytes), Some(mut stdin)) = (input, child.stdin.take()) {
            // A program that exits early closes the pipe; its exit status says more.
            if let Err(err) = stdin.write_all(bytes).await {
                if err.kind() != std::io::ErrorKind::BrokenPipe {
                    return Err(CodecError::Spawn(format!("{program} stdin: {err}")));
                }
            }
        }
        let output = time::timeout(self.timeout, child.wait_with_output())
            .await
            .map_err(|_| CodecError::Process {
                program: program.clone(),
                status: None,
                stderr: format!("timed out after {} ms", self.timeout.as_millis()),
            })?
            .map_err(|err| CodecError::Spawn(format!("{program}: {err}")))?;
        if !output.status.success() {
            return Err(CodecError::Process {
                program,
                status: output.status.code(),
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }
        Ok(output.stdout)
    }

    fn stage(&self, dir: &Path, name: &str, bytes: &[u8]) -> Result<PathBuf, CodecError> {
        let path = dir.join(name);
        std::fs::write(&path, bytes)
            .map_err(|err| CodecError::Spawn(format!("staging {}: {err}", path.display())))?;
        Ok(path)
    }
}

#[async_trait]
impl ConfigCodec for CommandCodec {
    async fn decode(&self, bytes: &[u8]) -> Result<ChannelConfig, CodecError> {
        let stdout = self.run(&["decode"], Some(bytes)).await?;
        serde_json::from_slice(&stdout).map_err(|err| CodecError::Decode(err.to_string()))
    }

    async fn encode(&self, config: &ChannelConfig) -> Result<Vec<u8>, CodecError> {
        let json = serde_json::to_vec(config).map_err(|err| CodecError::Encode(err.to_string()))?;
        self.run(&["encode"], Some(&json)).await
    }

    async fn diff(&self, original: &[u8], proposed: &[u8]) -> Result<Vec<u8>, CodecError> {
        let nanos = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_nanos();
        let dir = self.scratch_dir.join(format!("onboard-codec-{nanos}"));
        std::fs::create_dir_all(&dir)
            .map_err(|err| CodecError::Spawn(format!("scratch dir {}: {err}", dir.display())))?;
        let result = async {
            let original = self.stage(&dir, "original.pb", original)?;
            let proposed = self.stage(&dir, "proposed.pb", proposed)?;
            let original = original.display().to_string();
            let proposed = proposed.display().to_string();
            self.run(&["diff", &original, &proposed], None).await
        }
        .await;
        let _ = std::fs::remove_dir_all(&dir);
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::fixtures::{org, two_org_channel};

    #[tokio::test]
    async fn json_diff_round_trips_through_update() {
        let codec = JsonCodec;
        let original = two_org_channel();
        let mut proposed = original.clone();
        proposed
            .organizations
            .insert("Org3MSP".into(), org("org3", "Org3MSP"));
        let a = codec.encode(&original).await.unwrap();
        let b = codec.encode(&proposed).await.unwrap();
        let update = JsonCodec::decode_update(&codec.diff(&a, &b).await.unwrap()).unwrap();
        assert_eq!(update.base_sequence, original.sequence);
        assert_eq!(update.added.keys().collect::<Vec<_>>(), vec!["Org3MSP"]);
    }

    #[tokio::test]
    async fn json_decode_reports_garbage() {
        let err = JsonCodec.decode(b"not json").await.unwrap_err();
        assert!(matches!(err, CodecError::Decode(_)));
    }

    #[tokio::test]
    async fn missing_program_surfaces_spawn_error() {
        let codec = CommandCodec::new("/nonexistent/onboard-codec", Duration::from_secs(1));
        let err = codec.decode(b"{}").await.unwrap_err();
        assert!(matches!(err, CodecError::Spawn(_)));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn failing_program_surfaces_exit_status() {
        let codec = CommandCodec::new("false", Duration::from_secs(5));
        let err = codec.encode(&two_org_channel()).await.unwrap_err();
        match err {
            CodecError::Process { status, .. } => assert_eq!(status, Some(1)),
            other => panic!("unexpected error {other:?}"),
        }
    }
}
