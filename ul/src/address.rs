//! Data types for addressing application entities in a DICOM network.

use std::{
    net::{AddrParseError, SocketAddr, ToSocketAddrs},
    str::FromStr,
};

use snafu::{ensure, Backtrace, ResultExt, Snafu};

/// A rejected application entity title.
#[derive(Debug, Snafu)]
#[non_exhaustive]
pub enum InvalidAeTitleError {
    /// application entity title must not be empty
    EmptyAeTitle { backtrace: Backtrace },

    #[snafu(display("application entity title has {} characters, maximum is 16", length))]
    AeTitleTooLong { length: usize, backtrace: Backtrace },

    /// application entity title must be ASCII
    AeTitleNotAscii { backtrace: Backtrace },
}

/// A validated application entity title:
/// 1 to 16 ASCII characters,
/// space padded to 16 bytes on the wire.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct AeTitle(String);

impl AeTitle {
    /// Validate and wrap the given title.
    pub fn new(title: impl Into<String>) -> Result<Self, InvalidAeTitleError> {
        let title = title.into();
        ensure!(!title.trim().is_empty(), EmptyAeTitleSnafu);
        ensure!(
            title.len() <= 16,
            AeTitleTooLongSnafu { length: title.len() }
        );
        ensure!(title.is_ascii(), AeTitleNotAsciiSnafu);
        Ok(AeTitle(title))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl FromStr for AeTitle {
    type Err = InvalidAeTitleError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        AeTitle::new(s)
    }
}

impl TryFrom<&str> for AeTitle {
    type Error = InvalidAeTitleError;

    fn try_from(value: &str) -> Result<Self, Self::Error> {
        AeTitle::new(value)
    }
}

impl AsRef<str> for AeTitle {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for AeTitle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// A full address to a target application entity:
/// an AE title plus a network socket address.
///
/// These addresses can be serialized and parsed
/// with the syntax `{ae_title}@{socket_address}`.
///
/// # Example
///
/// ```
/// # use dicomnet_ul::address::FullAeAddr;
/// # use std::net::SocketAddr;
/// #
/// # fn main() -> Result<(), Box<dyn std::error::Error>> {
/// let addr: FullAeAddr = "COMMIT-SCP@127.0.0.1:11112".parse()?;
/// assert_eq!(addr.ae_title().as_str(), "COMMIT-SCP");
/// assert_eq!(addr.socket_addr(), SocketAddr::from(([127, 0, 0, 1], 11112)));
/// assert_eq!(&addr.to_string(), "COMMIT-SCP@127.0.0.1:11112");
/// # Ok(())
/// # }
/// ```
#[derive(Debug, Clone, PartialEq)]
pub struct FullAeAddr {
    ae_title: AeTitle,
    socket_addr: SocketAddr,
}

impl FullAeAddr {
    /// Create an AE address from its constituent parts.
    pub fn new(ae_title: AeTitle, socket_addr: SocketAddr) -> Self {
        FullAeAddr {
            ae_title,
            socket_addr,
        }
    }

    pub fn ae_title(&self) -> &AeTitle {
        &self.ae_title
    }

    pub fn socket_addr(&self) -> SocketAddr {
        self.socket_addr
    }
}

impl From<(AeTitle, SocketAddr)> for FullAeAddr {
    fn from((ae_title, socket_addr): (AeTitle, SocketAddr)) -> Self {
        Self::new(ae_title, socket_addr)
    }
}

#[derive(Debug, Snafu)]
#[non_exhaustive]
pub enum ParseAeAddressError {
    /// missing `@` separator in full AE address
    MissingPart { backtrace: Backtrace },

    /// invalid application entity title part
    ParseAeTitle {
        #[snafu(backtrace)]
        source: InvalidAeTitleError,
    },

    /// could not parse socket address part
    ParseSocketAddress {
        source: AddrParseError,
        backtrace: Backtrace,
    },
}

impl FromStr for FullAeAddr {
    type Err = ParseAeAddressError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (ae_title, addr) = s.split_once('@').ok_or_else(|| MissingPartSnafu.build())?;
        Ok(FullAeAddr {
            ae_title: ae_title.parse().context(ParseAeTitleSnafu)?,
            socket_addr: addr.parse().context(ParseSocketAddressSnafu)?,
        })
    }
}

impl ToSocketAddrs for FullAeAddr {
    type Iter = std::option::IntoIter<SocketAddr>;

    fn to_socket_addrs(&self) -> std::io::Result<Self::Iter> {
        self.socket_addr.to_socket_addrs()
    }
}

impl std::fmt::Display for FullAeAddr {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}@{}", self.ae_title, self.socket_addr)
    }
}
