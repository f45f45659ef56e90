//! Bot/human classification of open events

use std::time::Duration;

/// Verdict attached to every stored open
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Classification {
    pub is_bot: bool,
    pub bot_type: Option<String>,
}

impl Classification {
    pub fn human() -> Self {
        Self {
            is_bot: false,
            bot_type: None,
        }
    }

    pub fn bot(bot_type: impl Into<String>) -> Self {
        Self {
            is_bot: true,
            bot_type: Some(bot_type.into()),
        }
    }
}

/// Signals available when an open arrives
#[derive(Debug, Clone, Copy)]
pub struct OpenSignals<'a> {
    pub user_agent: &'a str,
    pub source_identifier: &'a str,
    /// Time between send and open; `None` if the clock says the open predates the send
    pub since_sent: Option<Duration>,
}

pub trait BotClassifier: Send + Sync {
    fn classify(&self, signals: &OpenSignals<'_>) -> Classification;
}

/// Known mail-proxy and scanner signatures, checked case-insensitively
const SCANNER_SIGNATURES: &[(&str, &str)] = &[
    ("googleimageproxy", "gmail_proxy"),
    ("ggpht.com", "gmail_proxy"),
    ("yahoomailproxy", "yahoo_proxy"),
    ("outlook-ios", "outlook_prefetch"),
    ("ms-office", "outlook_prefetch"),
    ("barracuda", "security_scanner"),
    ("mimecast", "security_scanner"),
    ("proofpoint", "security_scanner"),
    ("crawler", "crawler"),
    ("spider", "crawler"),
    ("curl/", "script"),
    ("python-requests", "script"),
];

/// `bot` as a whole word, or closing a product name as in `Googlebot/2.1`
/// or `AdsBot-Google`; device names such as `CUBOT X30` do not match
fn has_crawler_word(agent: &str) -> bool {
    let bytes = agent.as_bytes();
    let mut start = 0;
    while start < bytes.len() {
        if !bytes[start].is_ascii_alphanumeric() {
            start += 1;
            continue;
        }
        let end = bytes[start..]
            .iter()
            .position(|b| !b.is_ascii_alphanumeric())
            .map_or(bytes.len(), |n| start + n);
        let word = &agent[start..end];
        if word == "bot" || (word.ends_with("bot") && matches!(bytes.get(end).copied(), Some(b'/' | b'-'))) {
            return true;
        }
        start = end;
    }
    false
}

/// Signature and timing heuristics
///
/// Apple Mail Privacy Protection fetches with a bare `Mozilla/5.0` agent, and
/// prefetchers tend to open within seconds of delivery.
#[derive(Debug, Clone)]
pub struct HeuristicClassifier {
    pub prefetch_threshold: Duration,
}

impl Default for HeuristicClassifier {
    fn default() -> Self {
        Self {
            prefetch_threshold: Duration::from_secs(2),
        }
    }
}

impl BotClassifier for HeuristicClassifier {
    fn classify(&self, signals: &OpenSignals<'_>) -> Classification {
        let agent = signals.user_agent.trim().to_ascii_lowercase();
        if agent.is_empty() {
            return Classification::bot("missing_user_agent");
        }
        if let Some((_, bot_type)) = SCANNER_SIGNATURES
            .iter()
            .find(|(needle, _)| agent.contains(needle))
        {
            return Classification::bot(*bot_type);
        }
        if has_crawler_word(&agent) {
            return Classification::bot("crawler");
        }
        if agent == "mozilla/5.0" {
            return Classification::bot("apple_mpp");
        }
        match signals.since_sent {
            Some(elapsed) if elapsed < self.prefetch_threshold => Classification::bot("prefetch"),
            _ => Classification::human(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn signals(user_agent: &str, since_sent: u64) -> OpenSignals<'_> {
        OpenSignals {
            user_agent,
            source_identifier: "1.2.3.4",
            since_sent: Some(Duration::from_secs(since_sent)),
        }
    }

    #[test]
    fn test_classifications() {
        let classifier = HeuristicClassifier::default();
        let desktop = "Mozilla/5.0 (Macintosh; Intel Mac OS X 10_15_7) AppleWebKit/605.1.15";

        assert_eq!(classifier.classify(&signals(desktop, 600)), Classification::human());
        assert_eq!(
            classifier.classify(&signals(
                "Mozilla/5.0 (Windows NT 5.1; rv:11.0) Gecko Firefox/11.0 (via ggpht.com GoogleImageProxy)",
                600
            )),
            Classification::bot("gmail_proxy")
        );
        assert_eq!(
            classifier.classify(&signals("Mozilla/5.0", 600)),
            Classification::bot("apple_mpp")
        );
        assert_eq!(
            classifier.classify(&signals(desktop, 1)),
            Classification::bot("prefetch")
        );
        assert!(classifier.classify(&signals("", 600)).is_bot);
    }

    #[test]
    fn test_crawler_words() {
        let classifier = HeuristicClassifier::default();
        for agent in [
            "Mozilla/5.0 (compatible; Googlebot/2.1; +http://www.google.com/bot.html)",
            "Mozilla/5.0 (compatible; bingbot/2.0; +http://www.bing.com/bingbot.htm)",
            "AdsBot-Google (+http://www.google.com/adsbot.html)",
            "Link Preview Bot 1.0",
        ] {
            assert_eq!(
                classifier.classify(&signals(agent, 600)),
                Classification::bot("crawler"),
                "{}",
                agent
            );
        }

        for agent in [
            "Mozilla/5.0 (Linux; Android 10; CUBOT X30) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/120.0 Mobile Safari/537.36",
            "Mozilla/5.0 (Linux; Android 9; Cubot) AppleWebKit/537.36 Mobile Safari/537.36",
            "Mozilla/5.0 (Linux; Android 12; Robotics Edition) Gecko/20100101 Firefox/128.0",
        ] {
            assert_eq!(
                classifier.classify(&signals(agent, 600)),
                Classification::human(),
                "{}",
                agent
            );
        }
    }
}
