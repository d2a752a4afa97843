//! Map request paths to rate limit route keys.
//!
//! The remote API tracks quota per endpoint, not per resource, so variable
//! identifiers in a path collapse into placeholders. The exceptions (major
//! parameters the API keys its limits on, reaction shapes, webhook tokens)
//! are listed in `PATH_RULES` and applied top to bottom. Method specific
//! adjustments follow in [`RouteKey::new`].

use std::fmt;
use std::sync::LazyLock;

use regex::{Captures, Regex};

use crate::Method;

/// Milliseconds between the Unix epoch and the snowflake epoch (2015-01-01)
pub const SNOWFLAKE_EPOCH_MS: i64 = 1_420_070_400_000;

/// Messages older than this have their own delete limit
const OLD_MESSAGE_AGE_MS: i64 = 14 * 24 * 60 * 60 * 1000;

/// Messages younger than this have their own delete limit
const NEW_MESSAGE_AGE_MS: i64 = 10 * 1000;

/// Path segments whose identifier is part of the rate limit key
const MAJOR_PARAMETERS: &[&str] = &["channels", "guilds", "webhooks"];

/// Creation time of a snowflake ID in epoch milliseconds
#[must_use]
pub const fn snowflake_created_at(id: u64) -> i64 {
    // 42 bits of timestamp always fit
    #[allow(clippy::cast_possible_wrap)]
    let millis = (id >> 22) as i64;
    millis + SNOWFLAKE_EPOCH_MS
}

enum Rewrite {
    /// Replace the match with a fixed template (`$n` expands capture groups)
    Template(&'static str),
    /// Collapse `/<collection>/<id>` to `/<collection>/:id` unless the
    /// collection is a major parameter
    CollapseUnlessMajor,
}

struct PathRule {
    pattern: Regex,
    rewrite: Rewrite,
}

impl PathRule {
    fn new(pattern: &str, rewrite: Rewrite) -> Self {
        Self {
            pattern: Regex::new(pattern).expect("route patterns are valid literals"),
            rewrite,
        }
    }

    fn apply(&self, route: &str) -> String {
        match self.rewrite {
            Rewrite::Template(template) => self.pattern.replace_all(route, template).into_owned(),
            Rewrite::CollapseUnlessMajor => self
                .pattern
                .replace_all(route, |caps: &Captures<'_>| {
                    if MAJOR_PARAMETERS.contains(&&caps[1]) {
                        caps[0].to_owned()
                    } else {
                        format!("/{}/:id", &caps[1])
                    }
                })
                .into_owned(),
        }
    }
}

/// Path rewrites, in application order
static PATH_RULES: LazyLock<Vec<PathRule>> = LazyLock::new(|| {
    vec![
        PathRule::new(r"/([a-z-]+)/\d{15,21}", Rewrite::CollapseUnlessMajor),
        PathRule::new(r"/reactions/[^/]+", Rewrite::Template("/reactions/:id")),
        PathRule::new(
            r"/reactions/:id/[^/]+",
            Rewrite::Template("/reactions/:id/:userID"),
        ),
        PathRule::new(
            r"^/webhooks/(\d+)/[A-Za-z0-9_-]{64,}",
            Rewrite::Template("/webhooks/${1}/:token"),
        ),
    ]
});

static GUILD_CHANNELS: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"/guilds/[0-9]+/channels$").expect("route patterns are valid literals")
});

/// The rate limit bucket a request is counted against.
///
/// ```
/// use bucketeer_lib::{Method, RouteKey};
///
/// let a = RouteKey::new(Method::Get, "/channels/123456789012345678/messages/234567890123456789", 0);
/// let b = RouteKey::new(Method::Get, "/channels/123456789012345678/messages/345678901234567890", 0);
/// assert_eq!(a, b);
/// assert_eq!(a.as_str(), "/channels/123456789012345678/messages/:id");
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RouteKey(String);

impl RouteKey {
    /// Compute the key for `method` on `path`.
    ///
    /// `now` is the latency compensated current time in epoch milliseconds;
    /// it decides whether a message delete targets a new or an old message.
    #[must_use]
    pub fn new(method: Method, path: &str, now: i64) -> Self {
        let mut route = PATH_RULES
            .iter()
            .fold(path.to_owned(), |route, rule| rule.apply(&route));

        if method == Method::Delete && route.ends_with("/messages/:id") {
            let message_id = &path[path.rfind('/').map_or(0, |i| i + 1)..];
            route = format!("{}{route}", delete_prefix(message_id, now));
        } else if method == Method::Get && GUILD_CHANNELS.is_match(&route) {
            route = "/guilds/:id/channels".to_owned();
        }

        // Adding and removing reactions share one limit
        if matches!(method, Method::Put | Method::Delete) {
            if let Some(index) = route.find("/reactions") {
                route = format!("MODIFY{}", &route[..index + "/reactions".len()]);
            }
        }

        Self(route)
    }

    /// The key as a string slice
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

fn delete_prefix(message_id: &str, now: i64) -> &'static str {
    let Ok(id) = message_id.parse::<u64>() else {
        return "DELETE";
    };
    let age = now - snowflake_created_at(id);
    if age >= OLD_MESSAGE_AGE_MS {
        "DELETE_OLD"
    } else if age <= NEW_MESSAGE_AGE_MS {
        "DELETE_NEW"
    } else {
        "DELETE"
    }
}

impl fmt::Display for RouteKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<String> for RouteKey {
    fn from(route: String) -> Self {
        Self(route)
    }
}

impl From<&str> for RouteKey {
    fn from(route: &str) -> Self {
        Self(route.to_owned())
    }
}
