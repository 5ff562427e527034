//! # Classify
//!
//! Decide whether a failed broker or store call is worth retrying.
//!
//! Typed information is consulted first: rdkafka error codes, Postgres SQLSTATEs and
//! `std::io::ErrorKind`s found anywhere in an error's source chain. Only when none of those
//! settle the question do we fall back to substring matching on the rendered error message.
//! The substring lists below have been checked against the rdkafka, sqlx and tungstenite
//! versions pinned in this workspace; revisit them when bumping any of those.
use std::error::Error as StdError;
use std::fmt;
use std::io;

use rdkafka::error::{KafkaError, RDKafkaErrorCode};

/// Whether retrying an operation could possibly make it succeed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// Network and broker hiccups: retrying later may succeed.
    Transient,
    /// Bad configuration, rejected credentials, bad data or programmer errors.
    Fatal,
}

impl ErrorClass {
    pub fn is_transient(&self) -> bool {
        matches!(self, ErrorClass::Transient)
    }
}

impl fmt::Display for ErrorClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ErrorClass::Transient => write!(f, "transient"),
            ErrorClass::Fatal => write!(f, "fatal"),
        }
    }
}

/// Implemented by every error type the `RetryPolicy` is allowed to retry on.
pub trait Classify {
    fn class(&self) -> ErrorClass;
}

/// Markers that make an error fatal even if a transient marker also matches.
/// e.g. "SSL handshake failed: certificate verify failed" is a configuration problem.
const FATAL_MARKERS: &[&str] = &[
    "access denied",
    "access refused",
    "authentication",
    "authorization failed",
    "certificate verify failed",
    "forbidden",
    "invalid argument",
    "invalid configuration",
    "invalid credentials",
    "not authorized",
    "permission denied",
    "unauthorized",
];

const TRANSIENT_MARKERS: &[&str] = &[
    "all brokers down",
    "broken pipe",
    "connection aborted",
    "connection closed",
    "connection lost",
    "connection refused",
    "connection reset",
    "handshake",
    "leader not available",
    "network",
    "not enough replicas",
    "socket",
    "ssl",
    "temporarily unavailable",
    "throttl",
    "timed out",
    "timeout",
    "tls",
    "too many requests",
    "transport failure",
    "try again",
    "unavailable",
    "unexpected end of file",
    "unexpected eof",
];

/// Classify an error message against the marker lists. Unknown messages are fatal.
pub fn classify_message(message: &str) -> ErrorClass {
    let message = message.to_lowercase();

    if FATAL_MARKERS.iter().any(|marker| message.contains(marker)) {
        return ErrorClass::Fatal;
    }

    if TRANSIENT_MARKERS.iter().any(|marker| message.contains(marker)) {
        return ErrorClass::Transient;
    }

    ErrorClass::Fatal
}

/// Classify an I/O error kind, returning `None` for kinds that say nothing either way.
pub fn classify_io_kind(kind: io::ErrorKind) -> Option<ErrorClass> {
    match kind {
        io::ErrorKind::ConnectionRefused
        | io::ErrorKind::ConnectionReset
        | io::ErrorKind::ConnectionAborted
        | io::ErrorKind::NotConnected
        | io::ErrorKind::BrokenPipe
        | io::ErrorKind::TimedOut
        | io::ErrorKind::Interrupted
        | io::ErrorKind::WouldBlock
        | io::ErrorKind::UnexpectedEof => Some(ErrorClass::Transient),
        io::ErrorKind::PermissionDenied
        | io::ErrorKind::InvalidInput
        | io::ErrorKind::InvalidData
        | io::ErrorKind::Unsupported => Some(ErrorClass::Fatal),
        _ => None,
    }
}

/// Classify any error by walking its source chain for I/O errors, then by message.
pub fn classify(error: &(dyn StdError + 'static)) -> ErrorClass {
    let mut current = Some(error);

    while let Some(e) = current {
        if let Some(io_error) = e.downcast_ref::<io::Error>() {
            if let Some(class) = classify_io_kind(io_error.kind()) {
                return class;
            }
        }
        current = e.source();
    }

    classify_message(&render_chain(error))
}

/// Render an error and all its sources as a single message.
pub fn render_chain(error: &(dyn StdError + 'static)) -> String {
    let mut message = error.to_string();
    let mut current = error.source();

    while let Some(e) = current {
        message.push_str(": ");
        message.push_str(&e.to_string());
        current = e.source();
    }

    message
}

/// Classify an error reported by sqlx, preferring SQLSTATE codes when available.
pub fn classify_sqlx(error: &sqlx::Error) -> ErrorClass {
    match error {
        sqlx::Error::Io(e) => classify_io_kind(e.kind()).unwrap_or(ErrorClass::Transient),
        // TLS/handshake failures are usually network blips, unless the certificate itself is bad.
        sqlx::Error::Tls(e) => match classify_message(&e.to_string()) {
            ErrorClass::Fatal if !e.to_string().to_lowercase().contains("certificate") => {
                ErrorClass::Transient
            }
            class => class,
        },
        sqlx::Error::PoolTimedOut | sqlx::Error::PoolClosed => ErrorClass::Transient,
        sqlx::Error::Database(db_error) => match db_error.code() {
            // See: PostgreSQL SQLSTATE appendix
            // 08***  Connection Exception
            // 53***  Insufficient Resources
            // 57***  Operator Intervention
            // 58***  System Error
            // 40001  Serialization Failure
            // 40P01  Deadlock Detected
            Some(code) => {
                let code = code.as_ref();
                if code.starts_with("08")
                    || code.starts_with("53")
                    || code.starts_with("57")
                    || code.starts_with("58")
                    || code == "40001"
                    || code == "40003"
                    || code == "40P01"
                {
                    ErrorClass::Transient
                } else {
                    // 28*** invalid authorization, 42*** syntax or schema mismatch, 23***
                    // integrity violations: none of these go away by retrying.
                    ErrorClass::Fatal
                }
            }
            None => classify_message(db_error.message()),
        },
        sqlx::Error::Protocol(message) => classify_message(message),
        _ => ErrorClass::Fatal,
    }
}

/// Classify an error reported by rdkafka.
pub fn classify_kafka(error: &KafkaError) -> ErrorClass {
    match error {
        KafkaError::MessageConsumptionFatal(_) => ErrorClass::Fatal,
        KafkaError::ClientConfig(..) | KafkaError::ClientCreation(_) => ErrorClass::Fatal,
        KafkaError::Canceled => ErrorClass::Transient,
        other => match other.rdkafka_error_code() {
            Some(code) => classify_kafka_code(code),
            None => classify_message(&other.to_string()),
        },
    }
}

pub fn classify_kafka_code(code: RDKafkaErrorCode) -> ErrorClass {
    match code {
        RDKafkaErrorCode::AllBrokersDown
        | RDKafkaErrorCode::BrokerTransportFailure
        | RDKafkaErrorCode::BrokerNotAvailable
        | RDKafkaErrorCode::CoordinatorLoadInProgress
        | RDKafkaErrorCode::CoordinatorNotAvailable
        | RDKafkaErrorCode::LeaderNotAvailable
        | RDKafkaErrorCode::MessageTimedOut
        | RDKafkaErrorCode::NetworkException
        | RDKafkaErrorCode::NotEnoughReplicas
        | RDKafkaErrorCode::NotEnoughReplicasAfterAppend
        | RDKafkaErrorCode::NotLeaderForPartition
        | RDKafkaErrorCode::OperationTimedOut
        | RDKafkaErrorCode::QueueFull
        | RDKafkaErrorCode::RequestTimedOut
        | RDKafkaErrorCode::Resolve
        // Topics are created on first produce, consumers may subscribe before that.
        | RDKafkaErrorCode::UnknownTopic
        | RDKafkaErrorCode::UnknownTopicOrPartition => ErrorClass::Transient,
        RDKafkaErrorCode::Authentication
        | RDKafkaErrorCode::ClusterAuthorizationFailed
        | RDKafkaErrorCode::GroupAuthorizationFailed
        | RDKafkaErrorCode::InvalidArgument
        | RDKafkaErrorCode::InvalidMessage
        | RDKafkaErrorCode::InvalidTopic
        | RDKafkaErrorCode::MessageSizeTooLarge
        | RDKafkaErrorCode::SaslAuthenticationFailed
        | RDKafkaErrorCode::TopicAuthorizationFailed => ErrorClass::Fatal,
        other => classify_message(&other.to_string()),
    }
}

impl Classify for sqlx::Error {
    fn class(&self) -> ErrorClass {
        classify_sqlx(self)
    }
}

impl Classify for KafkaError {
    fn class(&self) -> ErrorClass {
        classify_kafka(self)
    }
}

impl Classify for io::Error {
    fn class(&self) -> ErrorClass {
        classify_io_kind(self.kind()).unwrap_or_else(|| classify_message(&self.to_string()))
    }
}
