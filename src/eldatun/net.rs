use std::borrow::Cow;

/// Normalizes a bind/listen address. Config files commonly use the shorthand `":PORT"` meaning
/// "bind on all interfaces", which `SocketAddr` parsing and tokio's bind APIs reject outright.
pub fn normalize_bind_addr(addr: &str) -> Cow<'_, str> {
    let addr = addr.trim();
    if addr.starts_with(':') {
        Cow::Owned(format!("0.0.0.0{addr}"))
    } else {
        Cow::Borrowed(addr)
    }
}

#[cfg(test)]
mod tests {
    use super::normalize_bind_addr;

    #[test]
    fn normalize_bind_addr_port_only() {
        assert_eq!(normalize_bind_addr(":8080").as_ref(), "0.0.0.0:8080");
        assert_eq!(normalize_bind_addr(" :7000 ").as_ref(), "0.0.0.0:7000");
    }

    #[test]
    fn normalize_bind_addr_passthrough() {
        assert_eq!(normalize_bind_addr("127.0.0.1:8080").as_ref(), "127.0.0.1:8080");
        assert_eq!(normalize_bind_addr("[::]:8080").as_ref(), "[::]:8080");
    }
}
