use std::io::{self, BufRead, Write};

/// Asks for the connection token. `None` when the user entered nothing.
pub fn prompt_token<R: BufRead, W: Write>(input: &mut R, output: &mut W) -> io::Result<Option<String>> {
    writeln!(output, "Connect Your Account")?;
    writeln!(output, "Enter your connection token to link this device with your account")?;
    write!(output, "Paste your token here: ")?;
    output.flush()?;

    let mut line = String::new();
    input.read_line(&mut line)?;

    let token = line.trim();
    if token.is_empty() {
        writeln!(output, "No token provided!")?;
        return Ok(None);
    }
    Ok(Some(token.to_string()))
}

#[cfg(test)]
mod tests {
    use std::io::Cursor;

    use super::*;

    #[test]
    fn token_is_read_and_trimmed() {
        let mut output = Vec::new();
        let token = prompt_token(&mut Cursor::new("  acct-42\n"), &mut output).unwrap();

        assert_eq!(token.as_deref(), Some("acct-42"));
        assert!(String::from_utf8(output).unwrap().contains("Paste your token here: "));
    }

    #[test]
    fn empty_input_means_no_token() {
        let mut output = Vec::new();
        assert_eq!(prompt_token(&mut Cursor::new("\n"), &mut output).unwrap(), None);
        assert_eq!(prompt_token(&mut Cursor::new(""), &mut output).unwrap(), None);
        assert!(String::from_utf8(output).unwrap().ends_with("No token provided!\n"));
    }
}
