//! Commands carried by the replicated log.

use crate::errors::StoreError;
use crate::rpc::proto;
use prost::Message as _;

/// Store command.
///
/// A store command is what a log entry asks every node to apply once the
/// entry commits. On the wire and on disk it is a command name plus an
/// opaque payload.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Command {
    /// Appended by a newly elected leader so entries from earlier terms can
    /// commit. Applying it has no effect.
    Noop,
    /// A SQL statement to execute against the local database.
    Query {
        /// The SQL text.
        sql: String,
    },
    /// Adds a node to the cluster's peer set.
    Join {
        /// Stable name of the joining node.
        name: String,
        /// Connection string the node's peer RPC is reachable at.
        connection_string: String,
    },
}

const NOOP: &str = "noop";
const QUERY: &str = "query";
const JOIN: &str = "join";

impl Command {
    /// The name of the command in the log.
    pub fn name(&self) -> &'static str {
        match self {
            Command::Noop => NOOP,
            Command::Query { .. } => QUERY,
            Command::Join { .. } => JOIN,
        }
    }

    /// Encodes the command payload.
    pub fn encode(&self) -> Vec<u8> {
        match self {
            Command::Noop => Vec::new(),
            Command::Query { sql } => sql.as_bytes().to_vec(),
            Command::Join {
                name,
                connection_string,
            } => proto::JoinCommand {
                name: name.clone(),
                connection_string: connection_string.clone(),
            }
            .encode_to_vec(),
        }
    }

    /// Decodes a payload previously produced by [`Command::encode`].
    pub fn decode(name: &str, payload: &[u8]) -> Result<Self, StoreError> {
        match name {
            NOOP => Ok(Command::Noop),
            QUERY => {
                let sql = String::from_utf8(payload.to_vec())
                    .map_err(|e| StoreError::InvalidCommand(format!("query is not UTF-8: {}", e)))?;
                Ok(Command::Query { sql })
            }
            JOIN => {
                let join = proto::JoinCommand::decode(payload)?;
                Ok(Command::Join {
                    name: join.name,
                    connection_string: join.connection_string,
                })
            }
            other => Err(StoreError::InvalidCommand(format!(
                "unknown command {:?}",
                other
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn payloads_decode_under_their_name() {
        let commands = vec![
            Command::Noop,
            Command::Query {
                sql: "CREATE TABLE t (x)".to_string(),
            },
            Command::Join {
                name: "a1b2c3d".to_string(),
                connection_string: "unix:///tmp/a1b2c3d.sock".to_string(),
            },
        ];
        for command in commands {
            let decoded = Command::decode(command.name(), &command.encode()).unwrap();
            assert_eq!(decoded, command);
        }
    }

    #[test]
    fn query_payload_is_the_raw_statement() {
        let command = Command::Query {
            sql: "SELECT 1".to_string(),
        };
        assert_eq!(command.encode(), b"SELECT 1".to_vec());
    }

    #[test]
    fn rejects_unknown_names_and_bad_payloads() {
        assert!(matches!(
            Command::decode("snapshot", b""),
            Err(StoreError::InvalidCommand(_))
        ));
        assert!(matches!(
            Command::decode("query", &[0xff, 0xfe]),
            Err(StoreError::InvalidCommand(_))
        ));
        assert!(matches!(
            Command::decode("join", &[0xff]),
            Err(StoreError::Decode(_))
        ));
    }
}
