use serde::{Deserialize, Serialize};

/// Statement prepared on the server. The id is assigned by the server and is stable for the
/// same query text, so a re-prepare after `Unprepared` keeps the handle valid.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PreparedQuery {
    pub id: Vec<u8>,
    pub query: String,
    pub keyspace: Option<String>,
}
