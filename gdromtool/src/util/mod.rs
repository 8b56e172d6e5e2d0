use std::{
    fmt,
    fmt::Write,
    path::{MAIN_SEPARATOR, Path},
};

use indicatif::ProgressStyle;

pub fn path_display(path: &Path) -> PathDisplay<'_> { PathDisplay { path } }

pub struct PathDisplay<'a> {
    path: &'a Path,
}

impl fmt::Display for PathDisplay<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut first = true;
        for segment in self.path.iter() {
            let segment_str = segment.to_string_lossy();
            if segment_str == "/" || segment_str == "." {
                continue;
            }
            if first {
                first = false;
            } else {
                f.write_char(MAIN_SEPARATOR)?;
            }
            f.write_str(&segment_str)?;
        }
        Ok(())
    }
}

/// Progress bar style shared by commands. `suffix` is appended after the bar.
pub fn bar_style(suffix: &str) -> ProgressStyle {
    ProgressStyle::with_template(&format!(
        "{{spinner:.green}} [{{elapsed_precise}}] [{{wide_bar:.cyan/blue}}] {suffix}"
    ))
    .unwrap()
    .progress_chars("#>-")
}
