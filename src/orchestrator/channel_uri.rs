//! Channel URI parsing: the small sum type replacing the ad-hoc
//! `sub:`/`pipe:`/`file:`/`route:` string prefixes (§6.3, §9 Design
//! Notes).

use crate::domain_types::{PipeName, TopicName};

/// A parsed ingress or egress channel declaration. Parsed once at
/// orchestrator plan time (§9 Design Notes).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChannelUri {
    /// `sub:<topic>` — consume from a pub/sub topic.
    Subscribe(TopicName),
    /// `pub:<topic>` — produce to a pub/sub topic.
    Publish(TopicName),
    /// `pipe:<name>` used as an ingress — consume from a point-to-point
    /// pipe.
    PipeIn(PipeName),
    /// `pipe:<name>` used as an egress — produce to a point-to-point
    /// pipe.
    PipeOut(PipeName),
    /// `file:<glob>` — an external file-system source, outside the
    /// broker entirely.
    FileSource(String),
    /// `file:<glob>` used as an egress — write results to the
    /// filesystem instead of the broker.
    FileSink(String),
    /// `stream:<name>` — a continuous external stream, modeled
    /// identically to a pipe at the broker boundary but named
    /// distinctly in cell files (§3, §6.3).
    Stream(String),
    /// `route:<selector>` — dispatch by a content-based selector rather
    /// than a fixed channel name.
    Route(String),
}

/// Which side of an agent instance a URI was declared on — parsing
/// differs because e.g. `pipe:x` means "consume" on ingress and
/// "produce" on egress (§3 Cell definition).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Side {
    /// The instance's `ingress` declaration.
    Ingress,
    /// The instance's `egress` declaration.
    Egress,
}

/// Errors parsing a channel URI.
#[derive(Debug, thiserror::Error)]
pub enum ChannelUriError {
    /// The URI had no recognized `scheme:` prefix.
    #[error("unrecognized channel URI: {0}")]
    UnrecognizedScheme(String),

    /// The URI had a recognized scheme but an empty or invalid body.
    #[error("invalid {scheme} channel name in {uri:?}: {reason}")]
    InvalidName {
        /// The scheme whose body failed to validate.
        scheme: &'static str,
        /// The full URI that failed.
        uri: String,
        /// Why the name was rejected (from the underlying `nutype`
        /// validation).
        reason: String,
    },
}

/// Parses a channel URI string, e.g. `sub:documents` or
/// `pipe:results`, into a [`ChannelUri`] appropriate for `side`.
///
/// # Errors
/// Returns [`ChannelUriError::UnrecognizedScheme`] if the string has no
/// `scheme:` prefix this framework knows, or
/// [`ChannelUriError::InvalidName`] if the scheme is known but the body
/// fails the underlying name validation (§3 `TopicName`/`PipeName`).
pub fn parse(uri: &str, side: Side) -> Result<ChannelUri, ChannelUriError> {
    let (scheme, body) = uri.split_once(':').ok_or_else(|| ChannelUriError::UnrecognizedScheme(uri.to_string()))?;

    match scheme {
        "sub" => topic(body, uri, "sub").map(ChannelUri::Subscribe),
        "pub" => topic(body, uri, "pub").map(ChannelUri::Publish),
        "pipe" => {
            let pipe = pipe(body, uri)?;
            Ok(match side {
                Side::Ingress => ChannelUri::PipeIn(pipe),
                Side::Egress => ChannelUri::PipeOut(pipe),
            })
        }
        "file" => Ok(match side {
            Side::Ingress => ChannelUri::FileSource(body.to_string()),
            Side::Egress => ChannelUri::FileSink(body.to_string()),
        }),
        "stream" => Ok(ChannelUri::Stream(body.to_string())),
        "route" => Ok(ChannelUri::Route(body.to_string())),
        _ => Err(ChannelUriError::UnrecognizedScheme(uri.to_string())),
    }
}

fn topic(body: &str, uri: &str, scheme: &'static str) -> Result<TopicName, ChannelUriError> {
    TopicName::try_from(body)
        .map_err(|err| ChannelUriError::InvalidName { scheme, uri: uri.to_string(), reason: err.to_string() })
}

fn pipe(body: &str, uri: &str) -> Result<PipeName, ChannelUriError> {
    PipeName::try_from(body)
        .map_err(|err| ChannelUriError::InvalidName { scheme: "pipe", uri: uri.to_string(), reason: err.to_string() })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_each_known_scheme() {
        assert_eq!(
            parse("sub:documents", Side::Ingress).unwrap(),
            ChannelUri::Subscribe(TopicName::try_from("documents").unwrap())
        );
        assert_eq!(
            parse("pub:documents", Side::Egress).unwrap(),
            ChannelUri::Publish(TopicName::try_from("documents").unwrap())
        );
        assert_eq!(
            parse("pipe:results", Side::Ingress).unwrap(),
            ChannelUri::PipeIn(PipeName::try_from("results").unwrap())
        );
        assert_eq!(
            parse("pipe:results", Side::Egress).unwrap(),
            ChannelUri::PipeOut(PipeName::try_from("results").unwrap())
        );
        assert_eq!(parse("file:in/*.json", Side::Ingress).unwrap(), ChannelUri::FileSource("in/*.json".into()));
        assert_eq!(parse("file:out/", Side::Egress).unwrap(), ChannelUri::FileSink("out/".into()));
        assert_eq!(parse("stream:audio", Side::Ingress).unwrap(), ChannelUri::Stream("audio".into()));
        assert_eq!(parse("route:by-language", Side::Egress).unwrap(), ChannelUri::Route("by-language".into()));
    }

    #[test]
    fn unrecognized_scheme_is_rejected() {
        let err = parse("ftp:whatever", Side::Ingress).unwrap_err();
        assert!(matches!(err, ChannelUriError::UnrecognizedScheme(u) if u == "ftp:whatever"));
    }

    #[test]
    fn missing_colon_is_rejected() {
        let err = parse("documents", Side::Ingress).unwrap_err();
        assert!(matches!(err, ChannelUriError::UnrecognizedScheme(_)));
    }

    #[test]
    fn empty_topic_name_is_rejected() {
        let err = parse("sub:", Side::Ingress).unwrap_err();
        assert!(matches!(err, ChannelUriError::InvalidName { scheme: "sub", .. }));
    }
}
