use std::fmt::Display;
use std::sync::LazyLock;
use std::time::{Duration, Instant};

use console::Style;
use indicatif::ProgressStyle;

const ANSI_BLUE: Style = Style::new().blue();

pub(crate) static STYLE_DISPATCH: LazyLock<ProgressStyle> = LazyLock::new(|| {
    ProgressStyle::default_bar()
        .template("{spinner:.green} [{elapsed}] [{bar:40.cyan/blue}] {pos}/{len} {msg}")
        .expect("Error setting progress bar template")
        .progress_chars("=>-")
});

pub(crate) static STYLE_ACTION: LazyLock<ProgressStyle> = LazyLock::new(|| {
    ProgressStyle::default_spinner()
        .template("{spinner:.blue} {msg}")
        .expect("Error setting progress bar template")
});

/// Time since `s`, as a dim suffix for log lines.
pub(crate) fn as_overhead(s: Instant) -> impl Display {
    as_duration(s.elapsed())
}

pub(crate) fn as_duration(d: Duration) -> impl Display {
    ANSI_BLUE.apply_to(format!("(+{}ms)", d.as_millis()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_as_duration() {
        console::set_colors_enabled(false);
        assert_eq!(as_duration(Duration::from_millis(42)).to_string(), "(+42ms)");
    }

    #[test]
    fn test_styles_parse() {
        LazyLock::force(&STYLE_DISPATCH);
        LazyLock::force(&STYLE_ACTION);
    }
}
