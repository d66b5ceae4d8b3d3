//! Key-value store accessor.
//!
//! The store carries the runtime policy (tunables and the regex corpus,
//! re-read per decision so operator changes take effect within one event),
//! the operator-visible mirrors of ban state, the unban queue, the name
//! lists, and the event bus channel. A missing policy key is seeded with
//! defaults exactly once; a present-but-malformed one is a fatal
//! configuration error.

use crate::error::StoreError;
use chrono::Utc;
use redis::AsyncCommands;
use redis::aio::ConnectionManager;
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, warn};

pub const OPTIONS_KEY: &str = "NETFILTER_OPTIONS";
pub const REGEX_KEY: &str = "NETFILTER_REGEX";
pub const CHANNEL: &str = "NETFILTER_CHANNEL";
pub const ACTIVE_BANS_KEY: &str = "NETFILTER_ACTIVE_BANS";
pub const PERM_BANS_KEY: &str = "NETFILTER_PERM_BANS";
pub const UNBAN_QUEUE_KEY: &str = "NETFILTER_QUEUE_UNBAN";
pub const WHITELIST_KEY: &str = "NETFILTER_WHITELIST";
pub const BLACKLIST_KEY: &str = "NETFILTER_BLACKLIST";
pub const LOG_KEY: &str = "NETFILTER_LOG";

/// Runtime tunables, stored as one JSON blob under [`OPTIONS_KEY`].
///
/// Operators sometimes write numeric strings instead of numbers; both are
/// accepted. A missing field is malformed (fatal), the same as bad JSON.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Options {
    #[serde(deserialize_with = "int_field")]
    pub ban_time: i64,
    #[serde(deserialize_with = "int_field")]
    pub max_attempts: i64,
    #[serde(deserialize_with = "int_field")]
    pub retry_window: i64,
    #[serde(deserialize_with = "int_field")]
    pub netban_ipv4: i64,
    #[serde(deserialize_with = "int_field")]
    pub netban_ipv6: i64,
}

impl Default for Options {
    fn default() -> Self {
        Options {
            ban_time: 1800,
            max_attempts: 10,
            retry_window: 600,
            netban_ipv4: 32,
            netban_ipv6: 128,
        }
    }
}

impl Options {
    pub fn parse(raw: &str) -> Result<Options, StoreError> {
        serde_json::from_str(raw).map_err(|_| StoreError::BadConfig(OPTIONS_KEY))
    }
}

fn int_field<'de, D>(deserializer: D) -> Result<i64, D::Error>
where
    D: serde::Deserializer<'de>,
{
    struct IntOrString;

    impl serde::de::Visitor<'_> for IntOrString {
        type Value = i64;

        fn expecting(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
            f.write_str("an integer or numeric string")
        }

        fn visit_i64<E: serde::de::Error>(self, v: i64) -> Result<i64, E> {
            Ok(v)
        }

        fn visit_u64<E: serde::de::Error>(self, v: u64) -> Result<i64, E> {
            i64::try_from(v).map_err(E::custom)
        }

        fn visit_str<E: serde::de::Error>(self, v: &str) -> Result<i64, E> {
            v.trim().parse().map_err(E::custom)
        }
    }

    deserializer.deserialize_any(IntOrString)
}

/// Seeded into [`REGEX_KEY`] when it is absent: the mail stack's
/// authentication-failure shapes, capture group 1 being the client address.
const DEFAULT_REGEX: [(&str, &str); 10] = [
    ("1", r"mailcow UI: Invalid password for .+ by ([0-9a-f\.:]+)"),
    ("2", r"Rspamd UI: Invalid password by ([0-9a-f\.:]+)"),
    ("3", r"warning: .*\[([0-9a-f\.:]+)\]: SASL .+ authentication failed"),
    ("4", r"warning: non-SMTP command from .*\[([0-9a-f\.:]+)]:.+"),
    ("5", r"NOQUEUE: reject: RCPT from \[([0-9a-f\.:]+)].+Protocol error.+"),
    (
        "6",
        r"-login: Disconnected.+ \(auth failed, .+\): user=.*, method=.+, rip=([0-9a-f\.:]+),",
    ),
    (
        "7",
        r"-login: Aborted login.+ \(auth failed .+\): user=.+, rip=([0-9a-f\.:]+), lip.+",
    ),
    (
        "8",
        r"-login: Aborted login.+ \(tried to use disallowed .+\): user=.+, rip=([0-9a-f\.:]+), lip.+",
    ),
    (
        "9",
        r"SOGo.+ Login from '([0-9a-f\.:]+)' for user .+ might not have worked",
    ),
    ("10", r#"([0-9a-f\.:]+) "GET /SOGo/.* HTTP.+" 403 .+"#),
];

/// Parse the corpus blob into (rule-id, pattern) pairs in ascending numeric
/// rule-id order.
pub fn parse_corpus(raw: &str) -> Result<Vec<(String, String)>, StoreError> {
    let map: serde_json::Map<String, serde_json::Value> =
        serde_json::from_str(raw).map_err(|_| StoreError::BadConfig(REGEX_KEY))?;
    let mut corpus = Vec::with_capacity(map.len());
    for (id, value) in map {
        let pattern = value
            .as_str()
            .ok_or(StoreError::BadConfig(REGEX_KEY))?
            .to_string();
        corpus.push((id, pattern));
    }
    corpus.sort_by(|(a, _), (b, _)| match (a.parse::<u64>(), b.parse::<u64>()) {
        (Ok(x), Ok(y)) => x.cmp(&y),
        _ => a.cmp(b),
    });
    Ok(corpus)
}

#[derive(Clone)]
pub struct Store {
    client: redis::Client,
    con: ConnectionManager,
}

impl Store {
    /// Connect to the store, retrying every 3 seconds until a PING
    /// round-trips.
    pub async fn connect(url: &str) -> Result<Store, StoreError> {
        let client = redis::Client::open(url)?;
        loop {
            match Self::try_connect(&client).await {
                Ok(con) => {
                    info!(url, "Connected to key-value store");
                    return Ok(Store { client, con });
                }
                Err(err) => {
                    warn!(error = %err, "{} - trying again in 3 seconds", err);
                    tokio::time::sleep(std::time::Duration::from_secs(3)).await;
                }
            }
        }
    }

    async fn try_connect(client: &redis::Client) -> Result<ConnectionManager, redis::RedisError> {
        let mut con = client.get_tokio_connection_manager().await?;
        redis::cmd("PING").query_async::<_, String>(&mut con).await?;
        Ok(con)
    }

    /// A dedicated pub/sub connection for the event channel.
    pub async fn subscribe(&self) -> Result<redis::aio::PubSub, StoreError> {
        let con = self.client.get_async_connection().await?;
        let mut pubsub = con.into_pubsub();
        pubsub.subscribe(CHANNEL).await?;
        Ok(pubsub)
    }

    /// Current tunables. Absent key: seed defaults (honoring the legacy
    /// per-value keys) and return them. Malformed key: fatal.
    pub async fn options(&self) -> Result<Options, StoreError> {
        let mut con = self.con.clone();
        let raw: Option<String> = con.get(OPTIONS_KEY).await?;
        match raw {
            Some(raw) => Options::parse(&raw),
            None => {
                let defaults = Options {
                    ban_time: self.legacy_int("NETFILTER_BAN_TIME", 1800).await?,
                    max_attempts: self.legacy_int("NETFILTER_MAX_ATTEMPTS", 10).await?,
                    retry_window: self.legacy_int("NETFILTER_RETRY_WINDOW", 600).await?,
                    netban_ipv4: self.legacy_int("NETFILTER_NETBAN_IPV4", 32).await?,
                    netban_ipv6: self.legacy_int("NETFILTER_NETBAN_IPV6", 128).await?,
                };
                let blob = serde_json::to_string(&defaults)
                    .map_err(|_| StoreError::BadConfig(OPTIONS_KEY))?;
                let _: () = con.set(OPTIONS_KEY, blob).await?;
                Ok(defaults)
            }
        }
    }

    async fn legacy_int(&self, key: &str, fallback: i64) -> Result<i64, StoreError> {
        let mut con = self.con.clone();
        let raw: Option<String> = con.get(key).await?;
        Ok(raw.and_then(|v| v.trim().parse().ok()).unwrap_or(fallback))
    }

    /// Current regex corpus, seeding the defaults when absent.
    pub async fn regex_corpus(&self) -> Result<Vec<(String, String)>, StoreError> {
        let mut con = self.con.clone();
        let raw: Option<String> = con.get(REGEX_KEY).await?;
        match raw {
            Some(raw) => parse_corpus(&raw),
            None => {
                let map: serde_json::Map<String, serde_json::Value> = DEFAULT_REGEX
                    .iter()
                    .map(|(id, pattern)| (id.to_string(), serde_json::Value::from(*pattern)))
                    .collect();
                let blob = serde_json::Value::Object(map).to_string();
                let _: () = con.set(REGEX_KEY, blob).await?;
                Ok(DEFAULT_REGEX
                    .iter()
                    .map(|(id, pattern)| (id.to_string(), pattern.to_string()))
                    .collect())
            }
        }
    }

    pub async fn set_active_ban(&self, net: &str, expires_at: i64) -> Result<(), StoreError> {
        let mut con = self.con.clone();
        let _: () = con.hset(ACTIVE_BANS_KEY, net, expires_at).await?;
        Ok(())
    }

    pub async fn del_active_ban(&self, net: &str) -> Result<(), StoreError> {
        let mut con = self.con.clone();
        let _: () = con.hdel(ACTIVE_BANS_KEY, net).await?;
        Ok(())
    }

    pub async fn set_perm_ban(&self, net: &str, installed_at: i64) -> Result<(), StoreError> {
        let mut con = self.con.clone();
        let _: () = con.hset(PERM_BANS_KEY, net, installed_at).await?;
        Ok(())
    }

    pub async fn del_perm_ban(&self, net: &str) -> Result<(), StoreError> {
        let mut con = self.con.clone();
        let _: () = con.hdel(PERM_BANS_KEY, net).await?;
        Ok(())
    }

    /// Networks the operator has queued for release.
    pub async fn unban_queue(&self) -> Result<Vec<String>, StoreError> {
        let mut con = self.con.clone();
        Ok(con.hkeys(UNBAN_QUEUE_KEY).await?)
    }

    pub async fn del_unban_queue(&self, net: &str) -> Result<(), StoreError> {
        let mut con = self.con.clone();
        let _: () = con.hdel(UNBAN_QUEUE_KEY, net).await?;
        Ok(())
    }

    /// Keys of an operator name-set hash (allowlist or blocklist).
    pub async fn name_set(&self, key: &str) -> Result<Vec<String>, StoreError> {
        let mut con = self.con.clone();
        Ok(con.hkeys(key).await?)
    }

    /// Drop both ban mirrors; part of `clear()`.
    pub async fn clear_ban_state(&self) -> Result<(), StoreError> {
        let mut con = self.con.clone();
        let _: () = con.del(ACTIVE_BANS_KEY).await?;
        let _: () = con.del(PERM_BANS_KEY).await?;
        Ok(())
    }

    pub async fn log_info(&self, message: String) {
        info!("{}", message);
        self.push_log("info", message).await;
    }

    pub async fn log_warn(&self, message: String) {
        warn!("{}", message);
        self.push_log("warn", message).await;
    }

    pub async fn log_crit(&self, message: String) {
        error!("{}", message);
        self.push_log("crit", message).await;
    }

    /// Mirror a log record to the store list; best-effort.
    async fn push_log(&self, priority: &str, message: String) {
        let record = serde_json::json!({
            "time": Utc::now().timestamp(),
            "priority": priority,
            "message": message,
        });
        let mut con = self.con.clone();
        if let Err(err) = con.lpush::<_, _, ()>(LOG_KEY, record.to_string()).await {
            debug!(error = %err, "failed to mirror log record to store");
        }
    }
}
