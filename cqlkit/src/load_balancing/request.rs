use derive_more::Constructor;

use crate::consistency::Consistency;

/// A request executed by a `Session`, as seen by load balancing.
#[derive(Constructor, Clone, Copy, Debug, Default)]
pub struct Request<'a> {
    pub keyspace: Option<&'a str>,
    pub consistency: Option<Consistency>,
}
