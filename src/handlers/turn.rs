//! TURN 자격증명 핸들러

use crate::config::TurnConfig;
use crate::protocol::{IceServer, TurnCredentials};
use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use hmac::{Hmac, Mac};
use sha1::Sha1;
use std::time::{SystemTime, UNIX_EPOCH};

type HmacSha1 = Hmac<Sha1>;

/// TURN 미설정 시 제공하는 공개 STUN 서버
const PUBLIC_STUN_SERVERS: [&str; 2] = [
    "stun:stun.l.google.com:19302",
    "stun:stun1.l.google.com:19302",
];

/// REST 요청용 자격증명 생성
///
/// TURN 서버가 설정되지 않았으면 인증 없는 공개 STUN 목록으로 대체한다.
pub fn issue_credentials(config: &TurnConfig) -> TurnCredentials {
    let now = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs();

    if config.url.is_empty() || config.secret.is_empty() {
        return TurnCredentials {
            ice_servers: PUBLIC_STUN_SERVERS
                .iter()
                .map(|url| IceServer {
                    urls: vec![url.to_string()],
                    username: None,
                    credential: None,
                    credential_type: None,
                })
                .collect(),
            ttl: config.credential_ttl,
            timestamp: now,
        };
    }

    TurnCredentials {
        ice_servers: generate_credentials(config),
        ttl: config.credential_ttl,
        timestamp: now,
    }
}

/// TURN 자격증명 생성 (RFC 5766 HMAC-SHA1)
fn generate_credentials(config: &TurnConfig) -> Vec<IceServer> {
    let now = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs();
    let expiry_time = now + config.credential_ttl;

    // username: 만료시각이 앞에 붙는 시한부 형식
    let random: u64 = rand::random();
    let base_username = format!("user_{}_{:x}", now, random);
    let credential_username = format!("{}:{}", expiry_time, base_username);

    let password = generate_hmac_hash(&credential_username, &config.secret);

    build_ice_servers(config, &credential_username, &password)
}

fn generate_hmac_hash(username: &str, secret: &str) -> String {
    let mut mac =
        HmacSha1::new_from_slice(secret.as_bytes()).expect("HMAC can take key of any size");
    mac.update(username.as_bytes());
    let result = mac.finalize();
    BASE64.encode(result.into_bytes())
}

fn build_ice_servers(config: &TurnConfig, username: &str, password: &str) -> Vec<IceServer> {
    let mut servers = Vec::new();
    let mut turn_urls = Vec::new();

    if config.enable_udp {
        turn_urls.push(format!("turn:{}:{}", config.url, config.ports.udp));
    }
    if config.enable_tcp {
        turn_urls.push(format!("turn:{}:{}", config.url, config.ports.tcp));
    }
    if config.enable_tls {
        turn_urls.push(format!(
            "turns:{}:{}?transport=tcp",
            config.url, config.ports.tls
        ));
    }

    // 폴백 서버 추가
    for fallback in &config.fallback_servers {
        if config.enable_tls {
            turn_urls.push(format!(
                "turns:{}:{}?transport=tcp",
                fallback, config.ports.tls
            ));
        } else {
            turn_urls.push(format!("turn:{}:{}", fallback, config.ports.udp));
        }
    }

    // TURN 서버 (인증 필요)
    for url in &turn_urls {
        servers.push(IceServer {
            urls: vec![url.clone()],
            username: Some(username.to_string()),
            credential: Some(password.to_string()),
            credential_type: Some("password".to_string()),
        });
    }

    // STUN 서버 (인증 불필요)
    if config.enable_udp {
        servers.push(IceServer {
            urls: vec![format!("stun:{}:{}", config.url, config.ports.udp)],
            username: None,
            credential: None,
            credential_type: None,
        });
    }

    servers
}

/// 자격증명 유효성 검증 (username 앞의 만료시각 확인)
pub fn validate_credentials(username: &str) -> bool {
    if let Some(expiry_str) = username.split(':').next() {
        if let Ok(expiry_time) = expiry_str.parse::<u64>() {
            let now = SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .unwrap_or_default()
                .as_secs();
            return expiry_time > now;
        }
    }
    false
}
