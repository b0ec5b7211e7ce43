use std::any::Any;

/// Extracts a readable message from a caught panic payload.
pub(crate) fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic payload".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::panic;

    #[test]
    fn test_panic_message_variants() {
        let static_payload = panic::catch_unwind(|| panic!("static message")).unwrap_err();
        assert_eq!(panic_message(static_payload.as_ref()), "static message");

        let owned_payload =
            panic::catch_unwind(|| panic!("owned {}", "message")).unwrap_err();
        assert_eq!(panic_message(owned_payload.as_ref()), "owned message");

        let other_payload = panic::catch_unwind(|| std::panic::panic_any(42_u8)).unwrap_err();
        assert_eq!(panic_message(other_payload.as_ref()), "unknown panic payload");
    }
}
