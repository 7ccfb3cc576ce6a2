//! Pairing token sources for `hsr-agent run` and `hsr-agent pair`.

use async_trait::async_trait;
use hsr_core::agent::PairingPrompt;
use hsr_core::errors::PairingError;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt, BufReader, Stderr, Stdin};
use tokio::sync::Mutex;
use tracing::warn;
use zeroize::Zeroizing;

pub const DEFAULT_MAX_ATTEMPTS: u32 = 3;

/// A token supplied up front (flag, config, environment). Offered once; if
/// the gateway rejects it, pairing gives up.
pub struct StaticTokenPrompt {
    token: Zeroizing<String>,
}

impl StaticTokenPrompt {
    pub fn new(token: impl Into<String>) -> Self {
        Self {
            token: Zeroizing::new(token.into()),
        }
    }
}

#[async_trait]
impl PairingPrompt for StaticTokenPrompt {
    async fn next_token(&self, attempt: u32, last_error: Option<&PairingError>) -> Option<String> {
        if let Some(err) = last_error {
            warn!(error = %err, "configured pairing token was not accepted");
        }
        (attempt == 1).then(|| self.token.to_string())
    }
}

/// Asks an operator for a token, one line per attempt.
pub struct LinePrompt<R, W> {
    io: Mutex<(R, W)>,
    max_attempts: u32,
}

pub type StdinPairingPrompt = LinePrompt<BufReader<Stdin>, Stderr>;

impl StdinPairingPrompt {
    pub fn stdin(max_attempts: u32) -> Self {
        LinePrompt::new(BufReader::new(tokio::io::stdin()), tokio::io::stderr(), max_attempts)
    }
}

impl<R, W> LinePrompt<R, W>
where
    R: AsyncBufRead + Unpin + Send,
    W: AsyncWrite + Unpin + Send,
{
    pub fn new(reader: R, writer: W, max_attempts: u32) -> Self {
        Self {
            io: Mutex::new((reader, writer)),
            max_attempts,
        }
    }

    pub fn into_writer(self) -> W {
        self.io.into_inner().1
    }
}

#[async_trait]
impl<R, W> PairingPrompt for LinePrompt<R, W>
where
    R: AsyncBufRead + Unpin + Send,
    W: AsyncWrite + Unpin + Send,
{
    async fn next_token(&self, attempt: u32, last_error: Option<&PairingError>) -> Option<String> {
        if attempt > self.max_attempts {
            return None;
        }
        let mut io = self.io.lock().await;
        let (reader, writer) = &mut *io;

        let mut banner = String::new();
        if let Some(err) = last_error {
            banner.push_str(&format!("Pairing failed: {err}\n"));
        }
        banner.push_str(&format!("Pairing token ({attempt}/{}): ", self.max_attempts));
        if writer.write_all(banner.as_bytes()).await.is_err() || writer.flush().await.is_err() {
            return None;
        }

        let mut line = Zeroizing::new(String::new());
        match reader.read_line(&mut *line).await {
            Ok(0) | Err(_) => None,
            Ok(_) => Some(line.trim().to_string()),
        }
    }
}
