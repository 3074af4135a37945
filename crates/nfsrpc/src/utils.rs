use crate::error;

pub type Result<T> = ::std::result::Result<T, error::Error>;

#[macro_export]
macro_rules! io_err {
    ($kind:ident, $msg:expr) => {
        ::std::io::Error::new(::std::io::ErrorKind::$kind, $msg)
    };
}

#[macro_export]
macro_rules! res {
    ($err:expr) => {
        Err(From::from($err))
    };
}

/// Split a `proto!host!port` address.
///
/// Only `tcp` is a meaningful protocol for this crate, but the protocol part is
/// returned as-is so callers can report what they were given.
pub fn parse_proto(arg: &str) -> Option<(&str, &str, u16)> {
    let mut split = arg.split('!');
    let (proto, addr, port) = (split.next()?, split.next()?, split.next()?);
    if split.next().is_some() || addr.is_empty() {
        return None;
    }

    Some((proto, addr, port.parse().ok()?))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_proto_accepts_tcp_address() {
        assert_eq!(
            parse_proto("tcp!nfs.example.com!2049"),
            Some(("tcp", "nfs.example.com", 2049))
        );
    }

    #[test]
    fn parse_proto_rejects_malformed() {
        assert_eq!(parse_proto("tcp!127.0.0.1"), None);
        assert_eq!(parse_proto("tcp!!2049"), None);
        assert_eq!(parse_proto("tcp!127.0.0.1!nfs"), None);
        assert_eq!(parse_proto("tcp!127.0.0.1!2049!x"), None);
    }
}
