//! Event matcher: the bus subscriber feeding the ban engine.
//!
//! The regex corpus is re-read per message so a bad pattern can be
//! hot-fixed without a restart. A pattern that fails to compile is skipped
//! silently; a corpus blob that fails to parse is fatal. Any failure of the
//! bus itself is fatal too: a daemon that cannot see events is not
//! enforcing policy.

use crate::context::Context;
use crate::engine::{self, BanEngine};
use crate::store::CHANNEL;
use futures_util::StreamExt;
use regex::Regex;
use std::net::IpAddr;
use std::sync::Arc;

/// First matching rule wins: returns its id and the captured address token.
pub fn match_event<'c>(corpus: &'c [(String, String)], payload: &str) -> Option<(&'c str, String)> {
    for (rule_id, pattern) in corpus {
        let Ok(re) = Regex::new(pattern) else {
            continue;
        };
        if let Some(token) = re.captures(payload).and_then(|caps| caps.get(1)) {
            return Some((rule_id.as_str(), token.as_str().to_string()));
        }
    }
    None
}

pub async fn run(ctx: Arc<Context>, engine: BanEngine) {
    ctx.store
        .log_info(format!("Watching store channel {}", CHANNEL))
        .await;

    let mut pubsub = match ctx.store.subscribe().await {
        Ok(pubsub) => pubsub,
        Err(err) => {
            ctx.store
                .log_crit(format!("Error subscribing to event channel: {}", err))
                .await;
            ctx.lifecycle.fatal();
            return;
        }
    };

    let mut shutdown = ctx.lifecycle.subscribe();
    let mut stream = pubsub.on_message();
    loop {
        tokio::select! {
            message = stream.next() => match message {
                Some(message) => {
                    if dispatch(&ctx, &engine, message).await.is_err() {
                        return;
                    }
                }
                None => {
                    if !ctx.lifecycle.should_quit() {
                        ctx.store
                            .log_warn("Error reading log line from pubsub".to_string())
                            .await;
                        ctx.lifecycle.fatal();
                    }
                    return;
                }
            },
            _ = shutdown.recv() => return,
        }
    }
}

/// Process one bus message. `Err` means a fatal condition was raised and
/// the loop must stop.
async fn dispatch(ctx: &Arc<Context>, engine: &BanEngine, message: redis::Msg) -> Result<(), ()> {
    let payload: String = match message.get_payload() {
        Ok(payload) => payload,
        Err(err) => {
            ctx.store
                .log_warn(format!("Error reading log line from pubsub: {}", err))
                .await;
            ctx.lifecycle.fatal();
            return Err(());
        }
    };

    let corpus = match ctx.store.regex_corpus().await {
        Ok(corpus) => corpus,
        Err(err) => {
            ctx.store
                .log_crit(format!("Error loading netfilter regex corpus: {}", err))
                .await;
            ctx.lifecycle.fatal();
            return Err(());
        }
    };

    let Some((rule_id, token)) = match_event(&corpus, &payload) else {
        return Ok(());
    };
    // An address-shaped token that does not parse drops the event.
    let Ok(addr) = token.parse::<IpAddr>() else {
        return Ok(());
    };
    let addr = engine::canonicalize(addr);
    if !engine::is_public(&addr) {
        return Ok(());
    }

    ctx.store
        .log_warn(format!("{} matched rule id {} ({})", addr, rule_id, payload))
        .await;

    if let Err(err) = engine.attempt(addr).await {
        ctx.store
            .log_crit(format!("Error processing matched event: {}", err))
            .await;
        ctx.lifecycle.fatal();
        return Err(());
    }
    Ok(())
}
