//! Peripheral identification helpers.

use btleplug::platform::PeripheralId;

use tagmux_types::TagId;

/// Address reported by platforms that hide the real one (CoreBluetooth).
const HIDDEN_ADDRESS: &str = "00:00:00:00:00:00";

/// Strip the `PeripheralId(...)` wrapper from a peripheral id's debug form.
pub fn format_peripheral_id(id: &PeripheralId) -> String {
    strip_wrapper(&format!("{:?}", id)).to_string()
}

/// Tag id for a peripheral: its Bluetooth address, or the platform id when
/// the address is hidden.
pub fn create_identifier(address: &str, peripheral_id: &PeripheralId) -> TagId {
    if address == HIDDEN_ADDRESS {
        TagId::new(format_peripheral_id(peripheral_id))
    } else {
        TagId::new(address)
    }
}

fn strip_wrapper(debug: &str) -> &str {
    debug
        .trim_start_matches("PeripheralId(")
        .trim_end_matches(')')
}
