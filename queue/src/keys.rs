use crate::constants::{
    DEAD_KEY_SEGMENT, DELAYED_KEY_SEGMENT, GROUP_KEY_SEGMENT, JOB_KEY_SEGMENT, LOCK_KEY_SEGMENT,
    PROCESSING_KEY_SEGMENT, READY_KEY_SEGMENT, SEQUENCE_KEY_SEGMENT,
};

/// Key layout for one queue namespace.
///
/// The group, ready and job keys are shared with other implementations of the
/// queue and must stay bit-exact. The Lua scripts derive the same keys from
/// the namespace argument.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueKeys {
    namespace: String,
}

impl QueueKeys {
    pub fn new(namespace: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
        }
    }

    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    pub fn group(&self, group_id: &str) -> String {
        format!("{}:{GROUP_KEY_SEGMENT}:{group_id}", self.namespace)
    }

    pub fn ready(&self) -> String {
        format!("{}:{READY_KEY_SEGMENT}", self.namespace)
    }

    pub fn job(&self, job_id: &str) -> String {
        format!("{}:{JOB_KEY_SEGMENT}:{job_id}", self.namespace)
    }

    pub fn sequence(&self) -> String {
        format!("{}:{SEQUENCE_KEY_SEGMENT}", self.namespace)
    }

    pub fn processing(&self) -> String {
        format!("{}:{PROCESSING_KEY_SEGMENT}", self.namespace)
    }

    pub fn lock(&self, group_id: &str) -> String {
        format!("{}:{LOCK_KEY_SEGMENT}:{group_id}", self.namespace)
    }

    pub fn delayed(&self) -> String {
        format!("{}:{DELAYED_KEY_SEGMENT}", self.namespace)
    }

    pub fn dead(&self) -> String {
        format!("{}:{DEAD_KEY_SEGMENT}", self.namespace)
    }

    pub fn group_pattern(&self) -> String {
        format!("{}:{GROUP_KEY_SEGMENT}:*", self.namespace)
    }

    pub fn namespace_pattern(&self) -> String {
        format!("{}:*", self.namespace)
    }

    /// Inverse of [`QueueKeys::group`].
    pub fn group_id_from_key<'a>(&self, key: &'a str) -> Option<&'a str> {
        key.strip_prefix(self.namespace.as_str())?
            .strip_prefix(':')?
            .strip_prefix(GROUP_KEY_SEGMENT)?
            .strip_prefix(':')
    }
}

#[cfg(test)]
mod tests {
    use super::QueueKeys;

    #[test]
    fn shared_keys_match_wire_layout() {
        let keys = QueueKeys::new("orders");
        assert_eq!(keys.group("tenant-7"), "orders:g:tenant-7");
        assert_eq!(keys.ready(), "orders:ready");
        assert_eq!(keys.job("abc"), "orders:job:abc");
    }

    #[test]
    fn internal_keys_live_under_namespace() {
        let keys = QueueKeys::new("ns");
        assert_eq!(keys.sequence(), "ns:seq");
        assert_eq!(keys.processing(), "ns:processing");
        assert_eq!(keys.lock("g1"), "ns:lock:g1");
        assert_eq!(keys.delayed(), "ns:delayed");
        assert_eq!(keys.dead(), "ns:dead");
        assert_eq!(keys.group_pattern(), "ns:g:*");
    }

    #[test]
    fn group_id_from_key_round_trips_ids_with_colons() {
        let keys = QueueKeys::new("a:b");
        let key = keys.group("user:42");
        assert_eq!(keys.group_id_from_key(&key), Some("user:42"));
        assert_eq!(keys.group_id_from_key("a:b:job:1"), None);
        assert_eq!(keys.group_id_from_key("other:g:1"), None);
    }
}
