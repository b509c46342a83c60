//! Terminal styling for `ranklane` output. Set `NO_COLOR` to get plain text.

use std::sync::OnceLock;

fn enabled() -> bool {
    static ENABLED: OnceLock<bool> = OnceLock::new();
    *ENABLED.get_or_init(|| std::env::var_os("NO_COLOR").is_none())
}

fn paint(sgr: &str, s: &str) -> String {
    if enabled() {
        format!("\x1b[{}m{}\x1b[0m", sgr, s)
    } else {
        s.to_string()
    }
}

pub fn green(s: &str) -> String {
    paint("32", s)
}

pub fn red(s: &str) -> String {
    paint("31", s)
}

pub fn yellow(s: &str) -> String {
    paint("33", s)
}

pub fn bold(s: &str) -> String {
    paint("1", s)
}

pub fn gray(s: &str) -> String {
    paint("90", s)
}

/// Four-column tag in front of one instruction outcome.
pub fn outcome_tag(ok: bool) -> String {
    if ok {
        green("ok  ")
    } else {
        red("fail")
    }
}

/// Rank header, right-aligned the way cargo prints its status lines.
pub fn status_label(label: &str) -> String {
    paint("1;32", &format!("{:>12}", label))
}
