use std::fmt;

use serde::{Deserialize, Serialize};

use crate::{MultiverseError, Result};

/// Namespace used when none is configured.
pub const DEFAULT_NAMESPACE: &str = "themultiverse";

/// Single-token wildcard.
pub const WILDCARD_ONE: &str = "*";
/// Trailing multi-token wildcard.
pub const WILDCARD_TAIL: &str = ">";

/// A broker subject (`a.b.c`), possibly containing wildcards when used as a
/// subscription pattern.
///
/// Subjects are only produced by [`SubjectScheme`] or [`Subject::parse`], so
/// every token is known to be legal.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Subject(String);

impl Subject {
    /// Parses a subject, accepting `*` and a final `>` as wildcard tokens.
    pub fn parse(raw: &str) -> Result<Self> {
        if raw.is_empty() {
            return Err(invalid("subject", raw, "must not be empty"));
        }
        let tokens: Vec<&str> = raw.split('.').collect();
        let last = tokens.len() - 1;
        for (i, token) in tokens.iter().enumerate() {
            match *token {
                WILDCARD_ONE => {}
                WILDCARD_TAIL if i == last => {}
                WILDCARD_TAIL => {
                    return Err(invalid("subject", raw, "'>' is only allowed as the last token"))
                }
                t => validate_token("subject", t).map_err(|_| {
                    invalid("subject", raw, "contains an empty or illegal token")
                })?,
            }
        }
        Ok(Self(raw.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// True when the subject contains a wildcard token and can only be subscribed to.
    pub fn is_pattern(&self) -> bool {
        self.tokens().any(|t| t == WILDCARD_ONE || t == WILDCARD_TAIL)
    }

    /// Checks whether a concrete subject is matched by this pattern.
    pub fn matches(&self, concrete: &str) -> bool {
        let mut pattern = self.tokens();
        let mut subject = concrete.split('.');
        loop {
            match (pattern.next(), subject.next()) {
                (Some(WILDCARD_TAIL), Some(_)) => return true,
                (Some(WILDCARD_ONE), Some(_)) => {}
                (Some(p), Some(s)) if p == s => {}
                (None, None) => return true,
                _ => return false,
            }
        }
    }

    fn tokens(&self) -> std::str::Split<'_, char> {
        self.0.split('.')
    }
}

impl fmt::Display for Subject {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for Subject {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl TryFrom<String> for Subject {
    type Error = MultiverseError;

    fn try_from(value: String) -> Result<Self> {
        Subject::parse(&value)
    }
}

impl From<Subject> for String {
    fn from(subject: Subject) -> Self {
        subject.0
    }
}

/// Maps logical intents (inbox, outbox, all-messages, DM stream) to subjects
/// under one namespace.
///
/// | Intent              | Subject                                  |
/// |---------------------|------------------------------------------|
/// | agent inbox         | `{namespace}.agents.{agent_key}.inbox`   |
/// | agent outbox        | `{namespace}.agents.{agent_key}.outbox`  |
/// | all-messages stream | `{namespace}.messages.all`               |
/// | per-user DM stream  | `{namespace}.messages.dm.{user_token}`   |
///
/// Agent keys must already be legal tokens. User ids (usually email
/// addresses) are mapped through [`encode_user_token`], so every non-empty
/// user id has exactly one DM stream.
///
/// Every component of a deployment must use the same namespace to see each
/// other's traffic.
///
/// # Examples
///
/// ```
/// use multiverse_core::SubjectScheme;
///
/// let scheme = SubjectScheme::default();
/// assert_eq!(
///     scheme.inbox("sylvia").unwrap().as_str(),
///     "themultiverse.agents.sylvia.inbox"
/// );
/// assert_eq!(
///     scheme.dm_stream("alice@example.com").unwrap().as_str(),
///     "themultiverse.messages.dm.alice@example%2Ecom"
/// );
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubjectScheme {
    namespace: String,
}

impl SubjectScheme {
    /// Creates a scheme; the namespace may span several dot-separated tokens.
    pub fn new(namespace: impl Into<String>) -> Result<Self> {
        let namespace = namespace.into();
        if namespace.is_empty() || namespace.split('.').any(|t| validate_token("namespace", t).is_err()) {
            return Err(invalid(
                "namespace",
                &namespace,
                "must be dot-separated tokens without whitespace, '*' or '>'",
            ));
        }
        Ok(Self { namespace })
    }

    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    pub fn inbox(&self, agent_key: &str) -> Result<Subject> {
        validate_token("agent key", agent_key)?;
        Ok(self.subject(format!("agents.{agent_key}.inbox")))
    }

    pub fn outbox(&self, agent_key: &str) -> Result<Subject> {
        validate_token("agent key", agent_key)?;
        Ok(self.subject(format!("agents.{agent_key}.outbox")))
    }

    pub fn all_messages(&self) -> Subject {
        self.subject("messages.all".to_string())
    }

    /// DM stream for a human user. Fails only for an empty id.
    pub fn dm_stream(&self, user_id: &str) -> Result<Subject> {
        let token = encode_user_token(user_id)?;
        Ok(self.subject(format!("messages.dm.{token}")))
    }

    /// Pattern matching every agent's inbox.
    pub fn all_inboxes(&self) -> Subject {
        self.subject(format!("agents.{WILDCARD_ONE}.inbox"))
    }

    /// Pattern matching every agent's outbox.
    pub fn all_outboxes(&self) -> Subject {
        self.subject(format!("agents.{WILDCARD_ONE}.outbox"))
    }

    /// Pattern matching the all-messages stream and every DM stream.
    pub fn all_message_streams(&self) -> Subject {
        self.subject(format!("messages.{WILDCARD_TAIL}"))
    }

    // Components are validated by the callers.
    fn subject(&self, rest: String) -> Subject {
        Subject(format!("{}.{}", self.namespace, rest))
    }
}

impl Default for SubjectScheme {
    fn default() -> Self {
        Self {
            namespace: DEFAULT_NAMESPACE.to_string(),
        }
    }
}

/// Validates one subject token: non-empty printable ASCII without `.`, `*` or `>`.
pub fn validate_token(kind: &'static str, token: &str) -> Result<()> {
    if token.is_empty() {
        return Err(invalid(kind, token, "must not be empty"));
    }
    if let Some(c) = token.chars().find(|c| !is_token_char(*c)) {
        let reason = match c {
            '.' => "must not contain '.'",
            '*' | '>' => "must not contain wildcard characters",
            _ => "must be printable ASCII without whitespace",
        };
        return Err(invalid(kind, token, reason));
    }
    Ok(())
}

/// Maps a user id into the subject-token alphabet.
///
/// Printable ASCII other than `.`, `*`, `>` and `%` is kept; every other
/// character is replaced by its UTF-8 bytes as `%XX` (uppercase hex). Escaping
/// `%` itself keeps the mapping injective, and [`decode_user_token`] inverts it.
pub fn encode_user_token(user_id: &str) -> Result<String> {
    if user_id.is_empty() {
        return Err(invalid("user id", user_id, "must not be empty"));
    }
    let mut token = String::with_capacity(user_id.len());
    for c in user_id.chars() {
        if is_token_char(c) && c != '%' {
            token.push(c);
        } else {
            let mut buf = [0u8; 4];
            for b in c.encode_utf8(&mut buf).bytes() {
                token.push_str(&format!("%{b:02X}"));
            }
        }
    }
    Ok(token)
}

/// Inverse of [`encode_user_token`].
pub fn decode_user_token(token: &str) -> Result<String> {
    let malformed = || invalid("user token", token, "malformed percent escape");
    let raw = token.as_bytes();
    let mut bytes = Vec::with_capacity(raw.len());
    let mut i = 0;
    while i < raw.len() {
        if raw[i] == b'%' {
            let hex = token.get(i + 1..i + 3).ok_or_else(malformed)?;
            bytes.push(u8::from_str_radix(hex, 16).map_err(|_| malformed())?);
            i += 3;
        } else {
            bytes.push(raw[i]);
            i += 1;
        }
    }
    String::from_utf8(bytes).map_err(|_| malformed())
}

fn is_token_char(c: char) -> bool {
    c.is_ascii_graphic() && !matches!(c, '.' | '*' | '>')
}

fn invalid(kind: &'static str, value: &str, reason: &'static str) -> MultiverseError {
    MultiverseError::InvalidIdentifier {
        kind,
        value: value.to_string(),
        reason,
    }
}
