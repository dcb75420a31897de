use indicatif::ProgressStyle;

/// Extension trait for creating named progress bars.
pub trait NamedProgress {
    /// Creates a progress bar style with a name label.
    ///
    /// # Arguments
    ///
    /// * `name` - Label to display with the progress bar
    fn named_bar(name: &str) -> Self;

    /// Creates a spinner style with a name label, for loops without a known length.
    fn named_spinner(name: &str) -> Self;
}

fn pad(name: &str) -> String {
    format!("{:<31}", name)
}

impl NamedProgress for ProgressStyle {
    fn named_bar(name: &str) -> Self {
        let fmt = pad(name)
            + "{wide_bar:40.cyan/blue} {pos:>3}/{len:<3} "
            + "[{elapsed_precise} ({eta} remaining)] {msg}";
        ProgressStyle::default_bar()
            .template(&fmt)
            .unwrap_or(ProgressStyle::default_bar())
    }

    fn named_spinner(name: &str) -> Self {
        let fmt = pad(name) + "{spinner} {pos} [{elapsed_precise}] {msg}";
        ProgressStyle::default_spinner()
            .template(&fmt)
            .unwrap_or(ProgressStyle::default_spinner())
    }
}
