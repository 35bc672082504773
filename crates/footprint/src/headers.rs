//! Browser-like request headers, regenerated for every attempt.

use rand::seq::SliceRandom;
use reqwest::header::{HeaderMap, HeaderValue, ACCEPT, CONNECTION, USER_AGENT};

pub trait HeaderSource: Send + Sync {
    fn headers(&self) -> HeaderMap;
}

const SAFARI_AGENTS: &[&str] = &[
    "Mozilla/5.0 (Macintosh; Intel Mac OS X 10_15_7) AppleWebKit/605.1.15 (KHTML, like Gecko) Version/17.4.1 Safari/605.1.15",
    "Mozilla/5.0 (Macintosh; Intel Mac OS X 10_15_7) AppleWebKit/605.1.15 (KHTML, like Gecko) Version/16.6 Safari/605.1.15",
    "Mozilla/5.0 (Macintosh; Intel Mac OS X 10_15_6) AppleWebKit/605.1.15 (KHTML, like Gecko) Version/15.6.1 Safari/605.1.15",
    "Mozilla/5.0 (iPhone; CPU iPhone OS 17_4 like Mac OS X) AppleWebKit/605.1.15 (KHTML, like Gecko) Version/17.4 Mobile/15E148 Safari/604.1",
    "Mozilla/5.0 (iPad; CPU OS 16_6 like Mac OS X) AppleWebKit/605.1.15 (KHTML, like Gecko) Version/16.6 Mobile/15E148 Safari/604.1",
    "Mozilla/5.0 (Macintosh; Intel Mac OS X 10_14_6) AppleWebKit/605.1.15 (KHTML, like Gecko) Version/14.1.2 Safari/605.1.15",
];

/// Picks a random Safari user agent per call.
#[derive(Clone, Copy, Debug, Default)]
pub struct BrowserHeaders;

impl HeaderSource for BrowserHeaders {
    fn headers(&self) -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert(ACCEPT, HeaderValue::from_static("*/*"));
        headers.insert(CONNECTION, HeaderValue::from_static("keep-alive"));
        if let Some(agent) = SAFARI_AGENTS.choose(&mut rand::thread_rng()) {
            headers.insert(USER_AGENT, HeaderValue::from_static(*agent));
        }
        headers
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn every_call_carries_a_known_agent() {
        for _ in 0..20 {
            let headers = BrowserHeaders.headers();
            let agent = headers[USER_AGENT].to_str().unwrap();
            assert!(SAFARI_AGENTS.iter().any(|known| *known == agent));
            assert_eq!(headers[ACCEPT], "*/*");
        }
    }
}
