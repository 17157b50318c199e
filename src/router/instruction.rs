// Remote system-instruction fetch with a TTL-gated cache. A fresh cache
// entry is served without a network hop; on fetch failure a stale entry
// is served, then the role's declared fallback, then the prior text.

use crate::roles::RemoteInstruction;
use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

const FETCH_TIMEOUT: Duration = Duration::from_secs(10);

struct CachedInstruction {
    text: String,
    fetched_at: Instant,
}

pub struct InstructionFetcher {
    http: reqwest::Client,
    ttl: Duration,
    cache: Mutex<HashMap<String, CachedInstruction>>,
}

impl InstructionFetcher {
    pub fn new(ttl: Duration) -> Self {
        let http = reqwest::Client::builder()
            .timeout(FETCH_TIMEOUT)
            .build()
            .unwrap_or_default();
        Self {
            http,
            ttl,
            cache: Mutex::new(HashMap::new()),
        }
    }

    /// Resolve the instruction text for a role declaring a remote
    /// source. `prior` is the text currently in effect.
    pub async fn resolve(&self, remote: &RemoteInstruction, prior: Option<&str>) -> String {
        if let Some(fresh) = self.cached(&remote.url, true) {
            debug!("Using cached instruction for {}", remote.url);
            return fresh;
        }

        match self.fetch(&remote.url).await {
            Ok(text) => {
                self.store(&remote.url, &text);
                text
            }
            Err(e) => {
                warn!("Instruction fetch from {} failed: {}", remote.url, e);
                if let Some(stale) = self.cached(&remote.url, false) {
                    return stale;
                }
                if let Some(fallback) = &remote.fallback {
                    return fallback.clone();
                }
                prior.unwrap_or_default().to_string()
            }
        }
    }

    async fn fetch(&self, url: &str) -> Result<String, String> {
        let resp = self
            .http
            .get(url)
            .send()
            .await
            .map_err(|e| e.to_string())?;
        if !resp.status().is_success() {
            return Err(format!("status {}", resp.status()));
        }
        resp.text().await.map_err(|e| e.to_string())
    }

    fn cached(&self, url: &str, require_fresh: bool) -> Option<String> {
        let cache = self.cache.lock().expect("instruction cache poisoned");
        let entry = cache.get(url)?;
        if require_fresh && entry.fetched_at.elapsed() >= self.ttl {
            return None;
        }
        Some(entry.text.clone())
    }

    fn store(&self, url: &str, text: &str) {
        let mut cache = self.cache.lock().expect("instruction cache poisoned");
        cache.insert(
            url.to_string(),
            CachedInstruction {
                text: text.to_string(),
                fetched_at: Instant::now(),
            },
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    /// Serve one HTTP response on an ephemeral port, then close.
    async fn one_shot_http(body: &'static str) -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            if let Ok((mut socket, _)) = listener.accept().await {
                let mut buf = [0u8; 1024];
                let _ = socket.read(&mut buf).await;
                let resp = format!(
                    "HTTP/1.1 200 OK\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
                    body.len(),
                    body
                );
                let _ = socket.write_all(resp.as_bytes()).await;
            }
        });
        format!("http://{}", addr)
    }

    #[tokio::test]
    async fn fetches_and_caches_within_ttl() {
        let url = one_shot_http("Be helpful.").await;
        let fetcher = InstructionFetcher::new(Duration::from_secs(300));
        let remote = RemoteInstruction {
            url: url.clone(),
            fallback: None,
        };
        let first = fetcher.resolve(&remote, None).await;
        assert_eq!(first, "Be helpful.");
        // The listener is gone; a cache miss would fail. Served from
        // cache instead.
        let second = fetcher.resolve(&remote, None).await;
        assert_eq!(second, "Be helpful.");
    }

    #[tokio::test]
    async fn failure_uses_fallback_then_prior() {
        let fetcher = InstructionFetcher::new(Duration::from_secs(300));
        let remote = RemoteInstruction {
            // Nothing listens here.
            url: "http://127.0.0.1:9".into(),
            fallback: Some("Fallback text.".into()),
        };
        assert_eq!(fetcher.resolve(&remote, Some("prior")).await, "Fallback text.");

        let no_fallback = RemoteInstruction {
            url: "http://127.0.0.1:9".into(),
            fallback: None,
        };
        assert_eq!(fetcher.resolve(&no_fallback, Some("prior")).await, "prior");
        assert_eq!(fetcher.resolve(&no_fallback, None).await, "");
    }

    #[tokio::test]
    async fn stale_cache_survives_fetch_failure() {
        let url = one_shot_http("Original.").await;
        let fetcher = InstructionFetcher::new(Duration::from_millis(1));
        let remote = RemoteInstruction {
            url: url.clone(),
            fallback: Some("Fallback.".into()),
        };
        assert_eq!(fetcher.resolve(&remote, None).await, "Original.");

        tokio::time::sleep(Duration::from_millis(10)).await;
        // TTL expired and the server is gone: stale beats fallback.
        assert_eq!(fetcher.resolve(&remote, None).await, "Original.");
    }
}
