use serde_json::Value;

/// Final assistant text from line-delimited JSON agent output.
///
/// `content_block_delta` text deltas accumulate until `message_stop`; a
/// `result` event or a completed `agent_message` item also finalises the
/// text. Malformed lines and unknown event types are skipped. Returns an
/// empty string when no terminal event was seen.
pub fn extract_final_text(stdout: &str) -> String {
    let mut pending = String::new();
    let mut finished: Option<String> = None;

    for value in events(stdout) {
        // Claude wraps raw API stream events when partial messages are on.
        let event = match value.get("type").and_then(Value::as_str) {
            Some("stream_event") => value.get("event").cloned().unwrap_or(Value::Null),
            _ => value,
        };

        match event.get("type").and_then(Value::as_str) {
            Some("message_start") => pending.clear(),
            Some("content_block_delta") => {
                let delta = &event["delta"];
                if delta.get("type").and_then(Value::as_str) == Some("text_delta") {
                    if let Some(text) = delta.get("text").and_then(Value::as_str) {
                        pending.push_str(text);
                    }
                }
            }
            Some("message_stop") => {
                finished = Some(std::mem::take(&mut pending));
            }
            Some("result") => {
                if let Some(text) = event.get("result").and_then(Value::as_str) {
                    finished = Some(text.to_string());
                }
            }
            Some("item.completed") => {
                let item = &event["item"];
                let kind = item
                    .get("type")
                    .or_else(|| item.get("item_type"))
                    .and_then(Value::as_str);
                if kind == Some("agent_message") {
                    if let Some(text) = item.get("text").and_then(Value::as_str) {
                        finished = Some(text.to_string());
                    }
                }
            }
            _ => {}
        }
    }

    finished.unwrap_or_default()
}

/// First string value under any of `keys` at the top level of an event.
pub fn find_session_id(stdout: &str, keys: &[&str]) -> String {
    events(stdout)
        .find_map(|event| {
            keys.iter().find_map(|key| {
                event
                    .get(*key)
                    .and_then(Value::as_str)
                    .filter(|s| !s.is_empty())
                    .map(str::to_string)
            })
        })
        .unwrap_or_default()
}

fn events(stdout: &str) -> impl Iterator<Item = Value> + '_ {
    stdout
        .lines()
        .map(str::trim)
        .filter(|l| l.starts_with('{'))
        .filter_map(|l| serde_json::from_str::<Value>(l).ok())
}
