//! Cloudflare 터널 탐색
//!
//! cloudflared를 서브프로세스로 띄우고 stderr에서 공개 URL을 긁어온다.
//! 바이너리가 없거나 URL이 안 나오면 터널 없이 계속 동작한다.

use crate::state::AppState;
use regex::Regex;
use std::process::Stdio;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command;

const TUNNEL_URL_PATTERN: &str = r"https://[a-zA-Z0-9-]+\.trycloudflare\.com";

/// 터널을 시작하고 공개 URL이 발견되면 상태에 기록한다
pub async fn start_tunnel(state: Arc<AppState>, port: u16) {
    let url_re = Regex::new(TUNNEL_URL_PATTERN).expect("tunnel URL pattern is valid");

    let mut child = match Command::new("cloudflared")
        .args([
            "tunnel",
            "--url",
            &format!("http://localhost:{}", port),
        ])
        .stdout(Stdio::null())
        .stderr(Stdio::piped())
        .spawn()
    {
        Ok(child) => child,
        Err(err) => {
            tracing::warn!(error = %err, "cloudflared not available, running without tunnel");
            return;
        }
    };

    let Some(stderr) = child.stderr.take() else {
        tracing::warn!("Failed to capture cloudflared stderr");
        return;
    };

    let mut lines = BufReader::new(stderr).lines();
    let mut discovered = false;

    while let Ok(Some(line)) = lines.next_line().await {
        if !discovered {
            if let Some(m) = url_re.find(&line) {
                let url = m.as_str().to_string();
                tracing::info!(url = %url, "Tunnel ready");
                *state.tunnel_url.write().await = Some(url);
                discovered = true;
                continue;
            }
            tracing::debug!(line = %line, "cloudflared");
        }
    }

    // 프로세스 종료까지 파이프를 계속 비워야 하므로 루프는 EOF에서만 끝난다
    tracing::warn!("Cloudflare tunnel closed");
    let _ = child.wait().await;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extracts_public_url_from_cloudflared_output() {
        let re = Regex::new(TUNNEL_URL_PATTERN).unwrap();
        let line = "2026-08-04T00:00:00Z INF +  https://witty-otter-demo.trycloudflare.com  +";
        assert_eq!(
            re.find(line).map(|m| m.as_str()),
            Some("https://witty-otter-demo.trycloudflare.com")
        );

        assert!(re.find("plain log line without url").is_none());
    }
}
