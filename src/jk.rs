//! A concrete JK BMS protocol description, ready to hand to
//! `protocol::unpack` / `ResponseDecoder::new`.
//!
//! This is a worked default, not a requirement of the generic engine —
//! callers may describe an entirely different device by building their own
//! `CompactProtocol`. Field-level offsets here follow the publicly
//! documented JK02-family BLE frame layout (segment header `55 AA EB 90`,
//! command header `AA 55 90 EB`, 300-byte frames, up to 24 cell taps);
//! exact register addresses for `TOGGLE_CHARGING`/`TOGGLE_DISCHARGING` are a
//! best-effort reconstruction — see DESIGN.md's Open Question entry.

use std::time::Duration;

use crate::protocol::{
    CompactCommand, CompactItem, CompactItemVariant, CompactProtocol, CompactResponse, CommandName, NumberType,
    ResponseKind, TextEncoding,
};

pub const SEGMENT_HEADER: [u8; 4] = [0x55, 0xAA, 0xEB, 0x90];
pub const COMMAND_HEADER: [u8; 4] = [0xAA, 0x55, 0x90, 0xEB];
pub const COMMAND_LENGTH: usize = 20;
pub const FRAME_LENGTH: usize = 300;
pub const MAX_CELLS: usize = 24;
pub const TEMPERATURE_SENSORS: usize = 2;

pub const SERVICE_UUID: &str = "0000ffe0-0000-1000-8000-00805f9b34fb";
pub const CHARACTERISTIC_UUID: &str = "0000ffe1-0000-1000-8000-00805f9b34fb";

/// Item keys that belong to the internal/bookkeeping part of a record
/// (frame plumbing, not BMS data) — see `session::INTERNAL_KEYS`.
pub const INTERNAL_KEYS: &[&str] = &[
    "_frame_header",
    "_signature",
    "_frame_length",
    "_reserved_block",
    "_reserved_block_1",
    "_reserved_block_2",
    "_checksum",
];

pub fn get_settings() -> CommandName {
    CommandName::new("GET_SETTINGS")
}

pub fn get_device_info() -> CommandName {
    CommandName::new("GET_DEVICE_INFO")
}

pub fn toggle_charging() -> CommandName {
    CommandName::new("TOGGLE_CHARGING")
}

pub fn toggle_discharging() -> CommandName {
    CommandName::new("TOGGLE_DISCHARGING")
}

pub fn settings_kind() -> ResponseKind {
    ResponseKind::new("SETTINGS")
}

pub fn cell_info_kind() -> ResponseKind {
    ResponseKind::new("CELL_INFO")
}

pub fn device_info_kind() -> ResponseKind {
    ResponseKind::new("DEVICE_INFO")
}

fn frame_prefix() -> Vec<CompactItem> {
    vec![
        CompactItem::new("_frame_header", SEGMENT_HEADER.len(), CompactItemVariant::Raw { getter: None }),
        CompactItem::new("_signature", 1, CompactItemVariant::Raw { getter: None }),
        CompactItem::new("_frame_length", 2, CompactItemVariant::numeric(NumberType::Uint16)),
    ]
}

fn voltage_item(key: &str) -> CompactItem {
    CompactItem::new(key, 4, CompactItemVariant::numeric(NumberType::Uint32).with_multiplier(0.001).with_precision(3))
}

fn settings_response() -> CompactResponse {
    let mut items = frame_prefix();
    items.push(voltage_item("smart_sleep_voltage"));
    items.push(voltage_item("cell_undervoltage_protection"));
    items.push(voltage_item("cell_undervoltage_recovery"));
    items.push(voltage_item("cell_overvoltage_protection"));
    items.push(voltage_item("cell_overvoltage_recovery"));
    items.push(voltage_item("balance_trigger_voltage"));
    items.push(CompactItem::new("_reserved_block_1", 250, CompactItemVariant::Raw { getter: None }));
    items.push(CompactItem::new("charging_enabled", 1, CompactItemVariant::Boolean));
    items.push(CompactItem::new("discharging_enabled", 1, CompactItemVariant::Boolean));
    items.push(CompactItem::new("balancer_enabled", 1, CompactItemVariant::Boolean));
    items.push(CompactItem::new("device_address", 1, CompactItemVariant::numeric(NumberType::Uint8)));
    items.push(CompactItem::new("_reserved_block_2", 14, CompactItemVariant::Raw { getter: None }));
    items.push(CompactItem::new("_checksum", 1, CompactItemVariant::Raw { getter: None }));

    CompactResponse {
        kind: settings_kind(),
        signature: vec![0x01],
        length: FRAME_LENGTH,
        items,
    }
}

fn cell_info_response() -> CompactResponse {
    let mut items = frame_prefix();

    for _ in 0..MAX_CELLS {
        items.push(
            CompactItem::new(
                "cell_voltage",
                2,
                CompactItemVariant::numeric(NumberType::Uint16).with_multiplier(0.001).with_precision(3),
            )
            .repeatable(),
        );
    }

    items.push(CompactItem::new(
        "pack_voltage",
        4,
        CompactItemVariant::numeric(NumberType::Uint32).with_multiplier(0.001).with_precision(2),
    ));
    items.push(CompactItem::new(
        "pack_current",
        4,
        CompactItemVariant::numeric(NumberType::Int32).with_multiplier(0.001).with_precision(2),
    ));
    items.push(CompactItem::new(
        "balance_current",
        2,
        CompactItemVariant::numeric(NumberType::Int16).with_multiplier(0.001).with_precision(2),
    ));

    for _ in 0..TEMPERATURE_SENSORS {
        items.push(
            CompactItem::new(
                "temperature",
                2,
                CompactItemVariant::numeric(NumberType::Int16).with_multiplier(0.1).with_precision(1),
            )
            .repeatable(),
        );
    }

    items.push(CompactItem::new(
        "mosfet_temperature",
        2,
        CompactItemVariant::numeric(NumberType::Int16).with_multiplier(0.1).with_precision(1),
    ));
    items.push(CompactItem::new("state_of_charge", 1, CompactItemVariant::numeric(NumberType::Uint8)));
    items.push(CompactItem::new(
        "remaining_capacity_ah",
        2,
        CompactItemVariant::numeric(NumberType::Uint16).with_multiplier(0.01).with_precision(2),
    ));
    items.push(CompactItem::new("cycle_count", 2, CompactItemVariant::numeric(NumberType::Uint16)));
    items.push(CompactItem::new("charging_enabled", 1, CompactItemVariant::Boolean));
    items.push(CompactItem::new("discharging_enabled", 1, CompactItemVariant::Boolean));
    items.push(CompactItem::new("_reserved_block", 221, CompactItemVariant::Raw { getter: None }));
    items.push(CompactItem::new("_checksum", 1, CompactItemVariant::Raw { getter: None }));

    CompactResponse {
        kind: cell_info_kind(),
        signature: vec![0x02],
        length: FRAME_LENGTH,
        items,
    }
}

fn device_info_response() -> CompactResponse {
    let mut items = frame_prefix();
    items.push(text_item("vendor_id", 16));
    items.push(text_item("hardware_version", 8));
    items.push(text_item("firmware_version", 8));
    items.push(text_item("device_name", 16));
    items.push(text_item("device_passcode", 16));
    items.push(text_item("manufacturing_date", 8));
    items.push(text_item("serial_number", 11));
    items.push(text_item("user_data", 16));
    items.push(CompactItem::new("_reserved_block", 193, CompactItemVariant::Raw { getter: None }));
    items.push(CompactItem::new("_checksum", 1, CompactItemVariant::Raw { getter: None }));

    CompactResponse {
        kind: device_info_kind(),
        signature: vec![0x03],
        length: FRAME_LENGTH,
        items,
    }
}

fn text_item(key: &str, len: usize) -> CompactItem {
    CompactItem::new(key, len, CompactItemVariant::Text { encoding: TextEncoding::Ascii })
}

/// The compact JK BMS protocol description. Pass to `protocol::unpack` or
/// `ResponseDecoder::new`.
pub fn protocol() -> CompactProtocol {
    CompactProtocol {
        service_uuid: SERVICE_UUID.to_string(),
        characteristic_uuid: CHARACTERISTIC_UUID.to_string(),
        segment_header: SEGMENT_HEADER.to_vec(),
        command_header: COMMAND_HEADER.to_vec(),
        command_length: COMMAND_LENGTH,
        inactivity_timeout: Duration::from_secs(10),
        connect_previous_timeout: Duration::from_secs(5),
        commands: vec![
            CompactCommand {
                name: get_settings(),
                code: vec![0x97, 0x00, 0x00, 0x00],
                timeout: Duration::from_secs(2),
                post_send_wait: Duration::from_millis(300),
            },
            CompactCommand {
                name: get_device_info(),
                code: vec![0x96, 0x00, 0x00, 0x00],
                timeout: Duration::from_secs(2),
                post_send_wait: Duration::from_millis(300),
            },
            CompactCommand {
                name: toggle_charging(),
                code: vec![0x01, 0x1D, 0x00, 0x00],
                timeout: Duration::from_secs(2),
                post_send_wait: Duration::from_millis(300),
            },
            CompactCommand {
                name: toggle_discharging(),
                code: vec![0x01, 0x1E, 0x00, 0x00],
                timeout: Duration::from_secs(2),
                post_send_wait: Duration::from_millis(300),
            },
        ],
        responses: vec![settings_response(), cell_info_response(), device_info_response()],
    }
}
