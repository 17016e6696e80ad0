//! Whitelist/blacklist policy deciding whether a kernel port is a modem
//! candidate, independent of the kernel's own `ID_MM_CANDIDATE` marker.

use crate::port::Subsystem;

/// One filter rule. A port matches a rule when every `Some` field agrees;
/// `None` fields are wildcards.
#[derive(Debug, Clone, Default)]
pub struct Rule {
    pub subsystem: Option<Subsystem>,
    pub driver: Option<String>,
}

impl Rule {
    fn matches(&self, subsystem: Subsystem, driver: &str) -> bool {
        self.subsystem.is_none_or(|s| s == subsystem) && self.driver.as_deref().is_none_or(|d| d == driver)
    }
}

/// Whitelist/blacklist policy. An empty whitelist admits everything not
/// blacklisted; a non-empty whitelist admits only what it names, still
/// subject to the blacklist.
#[derive(Debug, Clone, Default)]
pub struct PortFilter {
    whitelist: Vec<Rule>,
    blacklist: Vec<Rule>,
}

impl PortFilter {
    pub fn new(whitelist: Vec<Rule>, blacklist: Vec<Rule>) -> Self {
        Self { whitelist, blacklist }
    }

    /// `true` if a port on `subsystem` from `driver` is a modem candidate.
    pub fn accepts(&self, subsystem: Subsystem, driver: &str) -> bool {
        if self.blacklist.iter().any(|rule| rule.matches(subsystem, driver)) {
            return false;
        }
        self.whitelist.is_empty() || self.whitelist.iter().any(|rule| rule.matches(subsystem, driver))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_filter_accepts_everything() {
        let filter = PortFilter::default();
        assert!(filter.accepts(Subsystem::Tty, "option"));
    }

    #[test]
    fn blacklist_rejects_matching_driver_regardless_of_whitelist() {
        let filter = PortFilter::new(vec![], vec![Rule { subsystem: None, driver: Some("sierra_net".into()) }]);
        assert!(!filter.accepts(Subsystem::Net, "sierra_net"));
        assert!(filter.accepts(Subsystem::Net, "qmi_wwan"));
    }

    #[test]
    fn nonempty_whitelist_rejects_unlisted_subsystem() {
        let filter = PortFilter::new(vec![Rule { subsystem: Some(Subsystem::Tty), driver: None }], vec![]);
        assert!(filter.accepts(Subsystem::Tty, "option"));
        assert!(!filter.accepts(Subsystem::Usb, "option"));
    }

    #[test]
    fn blacklist_wins_over_whitelist_on_same_rule() {
        let whitelist = vec![Rule { subsystem: Some(Subsystem::Tty), driver: None }];
        let blacklist = vec![Rule { subsystem: Some(Subsystem::Tty), driver: Some("qcserial".into()) }];
        let filter = PortFilter::new(whitelist, blacklist);
        assert!(!filter.accepts(Subsystem::Tty, "qcserial"));
        assert!(filter.accepts(Subsystem::Tty, "option"));
    }
}
