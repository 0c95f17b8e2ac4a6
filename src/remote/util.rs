//! Path and command-line helpers for remote execution.

use std::borrow::Cow;
use std::ffi::OsString;

use shell_escape::unix::escape;

/// Expands a leading `~/` prefix to the user's home directory.
///
/// The input is returned unchanged when `HOME` is not set.
///
/// # Examples
///
/// ```
/// # use labrat::remote::expand_tilde;
/// let home = std::env::var("HOME").expect("HOME should be set");
/// assert_eq!(expand_tilde("~/.labrat/keys"), format!("{home}/.labrat/keys"));
/// assert_eq!(expand_tilde("/var/lib/labrat"), "/var/lib/labrat");
/// ```
#[must_use]
pub fn expand_tilde(path: &str) -> String {
    if let Some(rest) = path.strip_prefix("~/")
        && let Some(home) = std::env::var_os("HOME")
    {
        return format!("{}/{rest}", home.to_string_lossy());
    }
    path.to_owned()
}

/// Renders a program and its arguments as a copy-pasteable shell line.
///
/// Used for debug logging only; commands are never executed through a shell
/// locally.
#[must_use]
pub fn render_command_line(program: &str, args: &[OsString]) -> String {
    let mut parts = Vec::with_capacity(args.len() + 1);
    parts.push(escape(Cow::Borrowed(program)).into_owned());
    parts.extend(
        args.iter()
            .map(|arg| escape(arg.to_string_lossy()).into_owned()),
    );
    parts.join(" ")
}
