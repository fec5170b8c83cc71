use std::fmt;

/// What triggered a navigation cycle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NavigationSource {
    /// A named SPA navigation event dispatched on the document.
    SpaEvent(String),
    /// The location poller noticed a change no event announced.
    UrlPoll,
    /// `force_navigation` or an embedder-driven refresh.
    Manual,
    /// The location changed again while the previous cycle was running.
    Recheck,
}

impl fmt::Display for NavigationSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NavigationSource::SpaEvent(name) => write!(f, "event:{name}"),
            NavigationSource::UrlPoll => f.write_str("url-poll"),
            NavigationSource::Manual => f.write_str("manual"),
            NavigationSource::Recheck => f.write_str("recheck"),
        }
    }
}
