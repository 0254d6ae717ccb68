//! Header access for stored message bodies.

use mailparse::{MailAddr, MailHeaderMap};

/// The headers needed to display or address a stored body.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MessageHeaders {
    /// First mailbox of the `To` header.
    pub to: Option<String>,
    pub subject: Option<String>,
}

impl MessageHeaders {
    /// Parse the header block of an RFC 822 body. Malformed headers yield
    /// empty fields rather than an error.
    #[must_use]
    pub fn parse(body: &str) -> Self {
        let Ok((headers, _)) = mailparse::parse_headers(body.as_bytes()) else {
            return Self::default();
        };

        let subject = headers
            .get_first_value("Subject")
            .map(|subject| subject.trim().to_string())
            .filter(|subject| !subject.is_empty());

        let to = headers
            .get_first_header("To")
            .and_then(|header| mailparse::addrparse_header(header).ok())
            .and_then(|list| {
                list.iter().find_map(|addr| match addr {
                    MailAddr::Single(info) => Some(info.addr.clone()),
                    MailAddr::Group(group) => group.addrs.first().map(|info| info.addr.clone()),
                })
            })
            .filter(|addr| is_usable_address(addr));

        Self { to, subject }
    }
}

/// Superficial check that an address has a local part and a domain, and
/// nothing that could end or escape an SMTP command.
#[must_use]
pub fn is_usable_address(address: &str) -> bool {
    !address.contains(|c: char| c.is_whitespace() || c.is_control() || c == '<' || c == '>')
        && address
            .rsplit_once('@')
            .is_some_and(|(local, domain)| !local.is_empty() && !domain.is_empty())
}
