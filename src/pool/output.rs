//! Command output cleanup

/// Strip ANSI escape sequences and carriage returns, then trim surrounding
/// whitespace.
pub fn sanitize_output(raw: &str) -> String {
    let stripped = strip_ansi_escapes::strip_str(raw);
    stripped.replace('\r', "").trim().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_strips_ansi_and_cr() {
        assert_eq!(sanitize_output("\x1b[32mok\x1b[0m\r\n"), "ok");
        assert_eq!(sanitize_output("line1\r\nline2\r\n"), "line1\nline2");
    }

    #[test]
    fn test_plain_passthrough() {
        assert_eq!(sanitize_output("  hello world \n"), "hello world");
        assert_eq!(sanitize_output(""), "");
    }
}
