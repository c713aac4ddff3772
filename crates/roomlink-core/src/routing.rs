//! Routing scheme: deterministic queue names and routing keys.
//!
//! Two topic exchanges carry all traffic:
//!
//! - [`SERVER_EXCHANGE`] (`server-to-user`): broker → client. Every client
//!   owns a *public* queue bound with `room.<room>.broadcast.#` and a
//!   *private* queue bound with `room.<room>.client.<id>.#`.
//! - [`CLIENT_EXCHANGE`] (`user-to-server`): client → broker. Clients
//!   publish with `client.<id>.<action>`; the monitor consumes everything
//!   (`#`) and republishes onto the server exchange with
//!   `room.<room>.broadcast.client.<client>.<action>`.
//!
//! Every identifier spliced into a key is validated first. A `.` would add
//! words to the key and `*`/`#` would turn a binding into a wider pattern,
//! so any of them (or an empty identifier) is a [`RoutingError`].

use thiserror::Error;

/// Exchange carrying broker → client traffic.
pub const SERVER_EXCHANGE: &str = "server-to-user";

/// Exchange carrying client → broker traffic.
pub const CLIENT_EXCHANGE: &str = "user-to-server";

/// Word delimiter inside a routing key.
pub const DELIMITER: char = '.';

/// Matches exactly one word in a binding pattern.
pub const WILDCARD_ONE: char = '*';

/// Matches zero or more words in a binding pattern.
pub const WILDCARD_MANY: char = '#';

/// Binding pattern that matches every routing key.
pub const CATCH_ALL: &str = "#";

/// Routing-key construction failures.
#[derive(Clone, Debug, PartialEq, Eq, Error)]
pub enum RoutingError {
    /// The identifier is empty or contains a delimiter or wildcard.
    #[error("malformed {field} identifier {value:?}: must be non-empty and contain no '.', '*' or '#'")]
    MalformedIdentifier {
        /// Which input was rejected (`client`, `room`, `action`, ...).
        field: &'static str,
        /// The rejected value.
        value: String,
    },
}

/// Check that `value` can be spliced into a routing key as a single word.
pub fn validate_identifier<'a>(field: &'static str, value: &'a str) -> Result<&'a str, RoutingError> {
    let malformed = value.is_empty()
        || value
            .chars()
            .any(|c| c == DELIMITER || c == WILDCARD_ONE || c == WILDCARD_MANY);
    if malformed {
        return Err(RoutingError::MalformedIdentifier {
            field,
            value: value.to_owned(),
        });
    }
    Ok(value)
}

/// A queue name paired with the pattern it is bound with.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct QueueBinding {
    /// Queue name, unique per process.
    pub queue: String,
    /// Binding pattern on the owning exchange.
    pub routing_key: String,
}

/// Queue receiving room-wide broadcasts for one client.
///
/// `client.<id>.public` bound with `room.<room>.broadcast.#`.
pub fn public_queue(client: &str, room: &str) -> Result<QueueBinding, RoutingError> {
    let client = validate_identifier("client", client)?;
    let room = validate_identifier("room", room)?;
    Ok(QueueBinding {
        queue: format!("client.{client}.public"),
        routing_key: format!("room.{room}.broadcast.#"),
    })
}

/// Queue receiving messages addressed to one client only.
///
/// `client.<id>.private` bound with `room.<room>.client.<id>.#`.
pub fn private_queue(client: &str, room: &str) -> Result<QueueBinding, RoutingError> {
    let client = validate_identifier("client", client)?;
    let room = validate_identifier("room", room)?;
    Ok(QueueBinding {
        queue: format!("client.{client}.private"),
        routing_key: format!("room.{room}.client.{client}.#"),
    })
}

/// Routing key for a client action published to [`CLIENT_EXCHANGE`].
pub fn client_action_key(client: &str, action: &str) -> Result<String, RoutingError> {
    let client = validate_identifier("client", client)?;
    let action = validate_identifier("action", action)?;
    Ok(format!("client.{client}.{action}"))
}

/// Route segment the monitor derives for a client action:
/// `broadcast.client.<client>.<action>`.
pub fn broadcast_route(client: &str, action: &str) -> Result<String, RoutingError> {
    let client = validate_identifier("client", client)?;
    let action = validate_identifier("action", action)?;
    Ok(format!("broadcast.client.{client}.{action}"))
}

/// Prefix a route with its room: `room.<room>.<route>`.
///
/// `route` is a multi-word segment produced by [`broadcast_route`], so only
/// the room is validated here.
pub fn room_key(room: &str, route: &str) -> Result<String, RoutingError> {
    let room = validate_identifier("room", room)?;
    Ok(format!("room.{room}.{route}"))
}

/// Full routing key the monitor republishes with on [`SERVER_EXCHANGE`]:
/// `room.<room>.broadcast.client.<client>.<action>`.
pub fn republish_key(room: &str, client: &str, action: &str) -> Result<String, RoutingError> {
    let route = broadcast_route(client, action)?;
    room_key(room, &route)
}

/// The monitor's catch-all queue on [`CLIENT_EXCHANGE`].
pub fn monitor_queue(monitor: &str) -> Result<QueueBinding, RoutingError> {
    let monitor = validate_identifier("monitor", monitor)?;
    Ok(QueueBinding {
        queue: format!("monitor.{monitor}"),
        routing_key: CATCH_ALL.to_owned(),
    })
}

/// Topic-exchange matching of a routing key against a binding pattern.
///
/// Words are `.`-separated; `*` matches exactly one word and `#` matches
/// zero or more words.
pub fn topic_matches(pattern: &str, key: &str) -> bool {
    if pattern == key || pattern == CATCH_ALL {
        return true;
    }
    let pattern: Vec<&str> = pattern.split(DELIMITER).collect();
    let key: Vec<&str> = key.split(DELIMITER).collect();
    match_words(&pattern, &key)
}

fn match_words(pattern: &[&str], key: &[&str]) -> bool {
    match pattern.split_first() {
        None => key.is_empty(),
        Some((&"#", rest)) => {
            // `#` absorbs 0..=key.len() words
            (0..=key.len()).any(|skip| match_words(rest, &key[skip..]))
        }
        Some((&"*", rest)) => !key.is_empty() && match_words(rest, &key[1..]),
        Some((word, rest)) => key.first() == Some(word) && match_words(rest, &key[1..]),
    }
}
