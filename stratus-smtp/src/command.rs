use core::fmt::{self, Display, Formatter};

#[derive(PartialEq, PartialOrd, Eq, Hash, Debug)]
pub enum HeloVariant {
    Ehlo(String),
    Helo(String),
}

impl Display for HeloVariant {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            Self::Ehlo(host) => write!(f, "EHLO {host}"),
            Self::Helo(host) => write!(f, "HELO {host}"),
        }
    }
}

#[derive(Eq, PartialEq, Debug)]
pub enum Command {
    Helo(HeloVariant),
    /// `None` is the null reverse-path, `MAIL FROM:<>`.
    MailFrom(Option<String>),
    RcptTo(String),
    Data,
    Rset,
    Noop,
    Quit,
    /// A recognised verb with unusable arguments.
    Syntax(String),
    Invalid(String),
}

impl Display for Command {
    fn fmt(&self, fmt: &mut Formatter<'_>) -> fmt::Result {
        match self {
            Self::Helo(v) => Display::fmt(v, fmt),
            Self::MailFrom(from) => write!(fmt, "MAIL FROM:<{}>", from.as_deref().unwrap_or("")),
            Self::RcptTo(to) => write!(fmt, "RCPT TO:<{to}>"),
            Self::Data => fmt.write_str("DATA"),
            Self::Rset => fmt.write_str("RSET"),
            Self::Noop => fmt.write_str("NOOP"),
            Self::Quit => fmt.write_str("QUIT"),
            Self::Syntax(s) | Self::Invalid(s) => fmt.write_str(s),
        }
    }
}

/// Extract the address from a `<path>` argument, ignoring any ESMTP parameters.
fn path(argument: &str) -> Option<&str> {
    let argument = argument.trim();
    let path = argument
        .strip_prefix('<')
        .and_then(|rest| rest.split_once('>'))
        .map_or_else(
            || argument.split_whitespace().next().unwrap_or_default(),
            |(path, _)| path,
        );

    Some(path.trim()).filter(|path| !path.is_empty() || argument.starts_with("<>"))
}

fn has_prefix(command: &str, prefix: &str) -> bool {
    command
        .get(..prefix.len())
        .is_some_and(|start| start.eq_ignore_ascii_case(prefix))
}

impl TryFrom<&str> for Command {
    type Error = Self;

    fn try_from(command: &str) -> Result<Self, Self::Error> {
        let trimmed = command.trim();

        if has_prefix(trimmed, "MAIL FROM:") {
            match path(&trimmed[10..]) {
                Some("") => Ok(Self::MailFrom(None)),
                Some(from) => Ok(Self::MailFrom(Some(from.to_string()))),
                None => Err(Self::Syntax("Syntax: MAIL FROM:<address>".to_string())),
            }
        } else if has_prefix(trimmed, "RCPT TO:") {
            match path(&trimmed[8..]) {
                Some(to) if !to.is_empty() => Ok(Self::RcptTo(to.to_string())),
                _ => Err(Self::Syntax("Syntax: RCPT TO:<address>".to_string())),
            }
        } else if has_prefix(trimmed, "HELO") || has_prefix(trimmed, "EHLO") {
            match trimmed.split_once(' ') {
                None => Err(Self::Syntax(format!("Syntax: {} hostname", &trimmed[..4]))),
                Some((cmd, host)) if cmd.eq_ignore_ascii_case("HELO") => {
                    Ok(Self::Helo(HeloVariant::Helo(host.trim().to_string())))
                }
                Some((_, host)) => Ok(Self::Helo(HeloVariant::Ehlo(host.trim().to_string()))),
            }
        } else if trimmed.eq_ignore_ascii_case("DATA") {
            Ok(Self::Data)
        } else if trimmed.eq_ignore_ascii_case("RSET") {
            Ok(Self::Rset)
        } else if has_prefix(trimmed, "NOOP") {
            Ok(Self::Noop)
        } else if trimmed.eq_ignore_ascii_case("QUIT") {
            Ok(Self::Quit)
        } else {
            Err(Self::Invalid(command.to_owned()))
        }
    }
}

impl TryFrom<&[u8]> for Command {
    type Error = Self;

    fn try_from(command: &[u8]) -> Result<Self, Self::Error> {
        std::str::from_utf8(command).map_or_else(
            |_| Err(Self::Invalid("Unable to interpret command".to_string())),
            Self::try_from,
        )
    }
}
