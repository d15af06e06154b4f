use std::sync::Arc;

use arc_swap::ArcSwapOption;

/// Holds the keyspace last set with `USE`, shared by all connections of a session so new
/// connections start in the same keyspace.
#[derive(Default, Debug)]
pub struct KeyspaceHolder {
    current_keyspace: ArcSwapOption<String>,
}

impl KeyspaceHolder {
    #[inline]
    pub fn current_keyspace(&self) -> Option<Arc<String>> {
        self.current_keyspace.load().clone()
    }

    #[inline]
    pub fn update_current_keyspace(&self, keyspace: String) {
        self.current_keyspace.store(Some(Arc::new(keyspace)));
    }

    /// `USE` statement switching to the current keyspace, if one is set.
    pub fn use_statement(&self) -> Option<String> {
        self.current_keyspace()
            .map(|keyspace| use_keyspace_statement(&keyspace))
    }
}

/// Builds a `USE` statement, quoting the keyspace name.
pub(crate) fn use_keyspace_statement(keyspace: &str) -> String {
    format!("USE \"{}\"", keyspace.replace('"', "\"\""))
}
