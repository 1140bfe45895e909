//! # Process-Backed Transcoding Pipe
//!
//! Wraps one long-lived transcoder process and its three channels:
//! - **stdin**: provider-encoded audio batches in
//! - **stdout**: linear PCM out
//! - **stderr**: diagnostic lines, drained continuously into the log
//!
//! ## I/O Model:
//! Each `convert` is a write-then-read: the batch is written and flushed, then exactly
//! one read is attempted with a short deadline. The write is bounded by `write_timeout`
//! and the read by `read_timeout`, so a stalled transcoder fails the batch instead of
//! holding up the receive loop.
//!
//! ## Resource Safety:
//! The child is spawned with `kill_on_drop`, so a session that is cancelled or panics
//! still takes its process down with it. `drain_and_stop` is the graceful path.

use crate::bridge::protocol::MediaFormat;
use crate::config::TranscoderConfig;
use crate::error::BridgeError;
use crate::transcoder::{AudioConverter, ConverterFactory, OutputFormat};

use async_trait::async_trait;
use std::process::Stdio;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStdin, ChildStdout, Command};
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tracing::{debug, info, warn};

/// I/O limits applied to one pipe.
#[derive(Debug, Clone, Copy)]
pub struct PipeSettings {
    pub read_buffer_size: usize,
    pub read_timeout: Duration,
    pub write_timeout: Duration,
    pub drain_timeout: Duration,
}

impl From<&TranscoderConfig> for PipeSettings {
    fn from(config: &TranscoderConfig) -> Self {
        Self {
            read_buffer_size: config.read_buffer_size,
            read_timeout: config.read_timeout(),
            write_timeout: config.write_timeout(),
            drain_timeout: config.drain_timeout(),
        }
    }
}

/// One running transcoder process owned by one session.
pub struct TranscodingPipe {
    session_id: String,
    program: String,
    child: Option<Child>,
    stdin: Option<ChildStdin>,
    stdout: Option<ChildStdout>,
    stderr_task: Option<JoinHandle<()>>,
    read_buffer: Vec<u8>,
    settings: PipeSettings,
}

impl TranscodingPipe {
    /// Launch `program` with `args` and take ownership of its pipes.
    ///
    /// ## Errors:
    /// `BridgeError::PipeStart` if the binary cannot be found or launched.
    pub fn spawn(
        session_id: &str,
        program: &str,
        args: &[String],
        settings: PipeSettings,
    ) -> Result<Self, BridgeError> {
        let start_error = |source: std::io::Error| BridgeError::PipeStart {
            program: program.to_string(),
            source,
        };

        let mut child = Command::new(program)
            .args(args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(start_error)?;

        let missing = |channel: &str| start_error(std::io::Error::other(format!("{} was not captured", channel)));
        let stdin = child.stdin.take().ok_or_else(|| missing("stdin"))?;
        let stdout = child.stdout.take().ok_or_else(|| missing("stdout"))?;
        let stderr = child.stderr.take().ok_or_else(|| missing("stderr"))?;

        let stderr_task = tokio::spawn(log_stderr(session_id.to_string(), program.to_string(), stderr));

        info!(
            session_id = %session_id,
            program = %program,
            pid = ?child.id(),
            "Transcoder started"
        );

        Ok(Self {
            session_id: session_id.to_string(),
            program: program.to_string(),
            child: Some(child),
            stdin: Some(stdin),
            stdout: Some(stdout),
            stderr_task: Some(stderr_task),
            read_buffer: vec![0u8; settings.read_buffer_size.max(1)],
            settings,
        })
    }

    /// Whether the process has not yet been drained and stopped.
    #[cfg(test)]
    pub fn is_running(&self) -> bool {
        self.child.is_some()
    }
}

#[async_trait]
impl AudioConverter for TranscodingPipe {
    async fn convert(&mut self, batch: &[u8]) -> Result<Vec<u8>, BridgeError> {
        let stdin = self.stdin.as_mut().ok_or(BridgeError::PipeClosed)?;
        let write = async {
            stdin.write_all(batch).await?;
            stdin.flush().await
        };
        match timeout(self.settings.write_timeout, write).await {
            Ok(Ok(())) => {}
            Ok(Err(err)) => return Err(BridgeError::PipeWrite(err)),
            Err(_) => {
                warn!(
                    session_id = %self.session_id,
                    program = %self.program,
                    "Transcoder stopped reading input, write timed out after {:?}",
                    self.settings.write_timeout
                );
                return Err(BridgeError::PipeWrite(std::io::Error::new(
                    std::io::ErrorKind::TimedOut,
                    "transcoder input write timed out",
                )));
            }
        }

        let stdout = self.stdout.as_mut().ok_or(BridgeError::PipeClosed)?;
        let read = timeout(self.settings.read_timeout, stdout.read(&mut self.read_buffer)).await;
        match read {
            Ok(Ok(0)) => {
                debug!(session_id = %self.session_id, "Transcoder output reached end of stream");
                Ok(Vec::new())
            }
            Ok(Ok(n)) => Ok(self.read_buffer[..n].to_vec()),
            Ok(Err(err)) => Err(BridgeError::PipeRead(err)),
            // Nothing ready yet; the codec is still buffering this batch.
            Err(_) => Ok(Vec::new()),
        }
    }

    /// Close stdin, collect the remaining output, and reap the process.
    ///
    /// ## Cleanup Order:
    /// 1. Drop stdin so the transcoder sees end of input
    /// 2. Read stdout to end of stream (killing the process if it takes too long)
    /// 3. Wait for exit, then join the stderr drain task
    ///
    /// Steps 2 and 3 always run; a read failure is reported only after cleanup.
    async fn drain_and_stop(&mut self) -> Result<Vec<u8>, BridgeError> {
        let Some(mut child) = self.child.take() else {
            return Ok(Vec::new());
        };

        drop(self.stdin.take());

        let mut tail = Vec::new();
        let mut read_result = Ok(());
        if let Some(mut stdout) = self.stdout.take() {
            match timeout(self.settings.drain_timeout, stdout.read_to_end(&mut tail)).await {
                Ok(Ok(_)) => {}
                Ok(Err(err)) => read_result = Err(BridgeError::PipeRead(err)),
                Err(_) => {
                    warn!(
                        session_id = %self.session_id,
                        program = %self.program,
                        "Transcoder did not finish draining within {:?}, killing it",
                        self.settings.drain_timeout
                    );
                    if let Err(err) = child.start_kill() {
                        warn!(session_id = %self.session_id, "Failed to kill transcoder: {}", err);
                    }
                }
            }
        }

        match timeout(self.settings.drain_timeout, child.wait()).await {
            Ok(Ok(status)) => {
                debug!(session_id = %self.session_id, %status, tail_bytes = tail.len(), "Transcoder exited");
            }
            Ok(Err(err)) => {
                warn!(session_id = %self.session_id, "Failed to wait for transcoder: {}", err);
            }
            Err(_) => {
                warn!(session_id = %self.session_id, "Transcoder ignored end of input, killing it");
                if let Err(err) = child.kill().await {
                    warn!(session_id = %self.session_id, "Failed to kill transcoder: {}", err);
                }
            }
        }

        if let Some(task) = self.stderr_task.take() {
            if timeout(self.settings.drain_timeout, task).await.is_err() {
                warn!(session_id = %self.session_id, "Transcoder stderr did not close");
            }
        }

        read_result.map(|_| tail)
    }
}

/// Forward transcoder diagnostics to the log, one line at a time.
///
/// Keeps the stderr pipe empty so the process never blocks on it. Lines are taken as
/// raw bytes; invalid UTF-8 is logged lossily and never ends the drain.
async fn log_stderr<R>(session_id: String, program: String, stderr: R)
where
    R: AsyncRead + Unpin,
{
    let mut reader = BufReader::new(stderr);
    let mut line = Vec::new();
    loop {
        line.clear();
        match reader.read_until(b'\n', &mut line).await {
            Ok(0) => break,
            Ok(_) => {
                let text = String::from_utf8_lossy(&line);
                let text = text.trim();
                if !text.is_empty() {
                    warn!(session_id = %session_id, program = %program, "{}", text);
                }
            }
            Err(err) => {
                debug!(session_id = %session_id, "Stopped reading transcoder stderr: {}", err);
                break;
            }
        }
    }
}

/// Launches ffmpeg configured for low-latency raw streaming.
#[derive(Debug, Clone)]
pub struct FfmpegTranscoder {
    program: String,
    settings: PipeSettings,
}

impl FfmpegTranscoder {
    pub fn new(program: impl Into<String>, settings: PipeSettings) -> Self {
        Self {
            program: program.into(),
            settings,
        }
    }

    pub fn from_config(config: &TranscoderConfig) -> Self {
        Self::new(config.program.clone(), PipeSettings::from(config))
    }

    /// Command line for one stream.
    ///
    /// ## Low-latency flags:
    /// - `-fflags nobuffer -avioflags direct`: no internal input buffering
    /// - `-probesize 32 -analyzeduration 0`: no format sniffing delay on raw input
    /// - `-fflags discardcorrupt`: drop damaged packets instead of stalling
    /// - `-loglevel error`: only real problems reach stderr
    pub fn arguments(input: &MediaFormat, output: &OutputFormat) -> Vec<String> {
        let input_rate = input.sample_rate.to_string();
        let input_channels = input.channels.to_string();
        let output_rate = output.sample_rate.to_string();
        let output_channels = output.channels.to_string();

        [
            "-loglevel", "error",
            "-fflags", "nobuffer",
            "-avioflags", "direct",
            "-fflags", "discardcorrupt",
            "-probesize", "32",
            "-analyzeduration", "0",
            "-f", input.encoding.ffmpeg_format(),
            "-ar", input_rate.as_str(),
            "-ac", input_channels.as_str(),
            "-i", "pipe:0",
            "-ar", output_rate.as_str(),
            "-ac", output_channels.as_str(),
            "-acodec", "pcm_s16le",
            "-f", "s16le",
            "pipe:1",
        ]
        .iter()
        .map(|arg| arg.to_string())
        .collect()
    }
}

impl ConverterFactory for FfmpegTranscoder {
    fn start(
        &self,
        session_id: &str,
        input: &MediaFormat,
        output: &OutputFormat,
    ) -> Result<Box<dyn AudioConverter>, BridgeError> {
        let args = Self::arguments(input, output);
        debug!(session_id = %session_id, "Launching {} {}", self.program, args.join(" "));

        let pipe = TranscodingPipe::spawn(session_id, &self.program, &args, self.settings)?;
        Ok(Box::new(pipe))
    }

    fn describe(&self) -> String {
        self.program.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bridge::protocol::AudioEncoding;

    fn settings(read_timeout_ms: u64) -> PipeSettings {
        PipeSettings {
            read_buffer_size: 4096,
            read_timeout: Duration::from_millis(read_timeout_ms),
            write_timeout: Duration::from_secs(2),
            drain_timeout: Duration::from_secs(5),
        }
    }

    fn sh(script: &str) -> Vec<String> {
        vec!["-c".to_string(), script.to_string()]
    }

    #[test]
    fn test_ffmpeg_arguments() {
        let input = MediaFormat {
            encoding: AudioEncoding::Mulaw,
            sample_rate: 8000,
            channels: 1,
        };
        let output = OutputFormat {
            sample_rate: 16000,
            channels: 1,
        };

        let args = FfmpegTranscoder::arguments(&input, &output);
        let joined = args.join(" ");
        assert!(joined.starts_with("-loglevel error"));
        assert!(joined.contains("-probesize 32 -analyzeduration 0"));
        assert!(joined.contains("-f mulaw -ar 8000 -ac 1 -i pipe:0"));
        assert!(joined.contains("-ar 16000 -ac 1 -acodec pcm_s16le -f s16le"));
        assert_eq!(args.last().map(String::as_str), Some("pipe:1"));
    }

    #[tokio::test]
    async fn test_missing_binary_is_start_error() {
        let result = TranscodingPipe::spawn("s1", "definitely-not-a-transcoder-binary", &[], settings(10));
        assert!(matches!(result, Err(BridgeError::PipeStart { .. })));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_convert_reads_process_output() {
        let mut pipe = TranscodingPipe::spawn("s1", "cat", &[], settings(2000)).unwrap();

        let output = pipe.convert(b"hello").await.unwrap();
        assert_eq!(output, b"hello");

        let tail = pipe.drain_and_stop().await.unwrap();
        assert!(tail.is_empty());
        assert!(!pipe.is_running());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_slow_output_is_empty_then_drained() {
        let mut pipe = TranscodingPipe::spawn("s1", "sh", &sh("sleep 0.3; cat"), settings(10)).unwrap();

        // The process is not reading yet, so the bounded read comes back empty.
        let output = pipe.convert(b"abc").await.unwrap();
        assert!(output.is_empty());

        let tail = pipe.drain_and_stop().await.unwrap();
        assert_eq!(tail, b"abc");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_drain_is_idempotent_and_closes_pipe() {
        let mut pipe = TranscodingPipe::spawn("s1", "cat", &[], settings(10)).unwrap();

        pipe.drain_and_stop().await.unwrap();
        assert!(pipe.drain_and_stop().await.unwrap().is_empty());
        assert!(matches!(pipe.convert(b"late").await, Err(BridgeError::PipeClosed)));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_write_to_dead_process_fails_and_drain_is_safe() {
        let mut pipe = TranscodingPipe::spawn("s1", "sh", &sh("exit 0"), settings(10)).unwrap();
        tokio::time::sleep(Duration::from_millis(300)).await;

        let result = pipe.convert(&[0x7f; 1024]).await;
        assert!(matches!(result, Err(BridgeError::PipeWrite(_))));

        assert!(pipe.drain_and_stop().await.is_ok());
        assert!(!pipe.is_running());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_stalled_process_times_out_write() {
        let settings = PipeSettings {
            read_buffer_size: 4096,
            read_timeout: Duration::from_millis(5),
            write_timeout: Duration::from_millis(200),
            drain_timeout: Duration::from_millis(500),
        };
        let mut pipe = TranscodingPipe::spawn("s1", "sh", &sh("sleep 30"), settings).unwrap();

        // The child never reads stdin; once the OS pipe buffer is full the write must give up.
        let outcome = tokio::time::timeout(Duration::from_secs(10), async {
            for _ in 0..1000 {
                if let Err(err) = pipe.convert(&[0x7f; 640]).await {
                    return Some(err);
                }
            }
            None
        })
        .await
        .expect("convert blocked on a stalled transcoder");

        match outcome {
            Some(BridgeError::PipeWrite(err)) => assert_eq!(err.kind(), std::io::ErrorKind::TimedOut),
            other => panic!("expected a write timeout, got {:?}", other),
        }

        let drained = tokio::time::timeout(Duration::from_secs(5), pipe.drain_and_stop()).await;
        assert!(drained.is_ok());
        assert!(!pipe.is_running());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_stderr_does_not_block_process() {
        // Far more than a pipe buffer of stderr before echoing stdin.
        let script = "i=0; while [ $i -lt 5000 ]; do echo 'diagnostic line' >&2; i=$((i+1)); done; cat";
        let mut pipe = TranscodingPipe::spawn("s1", "sh", &sh(script), settings(3000)).unwrap();

        let mut output = pipe.convert(b"pcm").await.unwrap();
        output.extend(pipe.drain_and_stop().await.unwrap());
        assert_eq!(output, b"pcm");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_invalid_utf8_on_stderr_keeps_draining() {
        let script = "printf '\\377\\376 bad\\n' >&2; \
                      i=0; while [ $i -lt 5000 ]; do echo 'diagnostic line' >&2; i=$((i+1)); done; cat";
        let mut pipe = TranscodingPipe::spawn("s1", "sh", &sh(script), settings(3000)).unwrap();

        let mut output = pipe.convert(b"pcm").await.unwrap();
        output.extend(pipe.drain_and_stop().await.unwrap());
        assert_eq!(output, b"pcm");
    }
}
