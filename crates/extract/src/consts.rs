use regex::Regex;
use std::sync::LazyLock;

macro_rules! regex {
    ($name:ident, $regex:expr) => {
        pub(crate) static $name: LazyLock<Regex> = LazyLock::new(|| Regex::new($regex).unwrap());
    };
}

regex!(DEFAULT_TICKET_REGEX, crate::DEFAULT_PATTERN);
// Redmine issue links, as found in a browser's download referrer.
regex!(ISSUE_URL_REGEX, r"/issues/([0-9]+)(?:$|[?#/.])");
// One leading `[tag]` of a ticket subject.
regex!(TITLE_TAG_REGEX, r"^\s*\[([^\]]*)\]");
