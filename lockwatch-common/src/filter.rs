/// How the `MNTNS_FILTER` set is interpreted.
#[repr(u8)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum FilterMode {
    #[default]
    Disabled = 0,
    /// Only namespaces in the set are traced.
    Allow = 1,
    /// Namespaces in the set are dropped.
    Deny = 2,
}

impl From<u8> for FilterMode {
    fn from(raw: u8) -> Self {
        match raw {
            1 => FilterMode::Allow,
            2 => FilterMode::Deny,
            // Uninitialized or unknown state traces everything.
            _ => FilterMode::Disabled,
        }
    }
}

impl FilterMode {
    /// Decide from the mode and a single membership lookup.
    #[inline(always)]
    pub fn discards(self, listed: bool) -> bool {
        match self {
            FilterMode::Disabled => false,
            FilterMode::Allow => !listed,
            FilterMode::Deny => listed,
        }
    }
}

/// Read-only view of the namespace filter consulted on every capture.
pub trait MountNsFilter {
    fn should_discard(&self, mntns_id: u64) -> bool;
}

impl<F: MountNsFilter + ?Sized> MountNsFilter for &F {
    #[inline(always)]
    fn should_discard(&self, mntns_id: u64) -> bool {
        (**self).should_discard(mntns_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_discards_by_mode() {
        assert!(!FilterMode::Disabled.discards(true));
        assert!(!FilterMode::Disabled.discards(false));
        assert!(FilterMode::Allow.discards(false));
        assert!(!FilterMode::Allow.discards(true));
        assert!(FilterMode::Deny.discards(true));
        assert!(!FilterMode::Deny.discards(false));
    }

    #[test]
    fn test_unknown_raw_mode_is_disabled() {
        assert_eq!(FilterMode::from(0), FilterMode::Disabled);
        assert_eq!(FilterMode::from(42), FilterMode::Disabled);
        assert_eq!(FilterMode::from(1), FilterMode::Allow);
    }
}
