//! Human-readable error descriptions and structured JSON error formatting.

use fluidics_core::{CommandError, FluidicsError, ProtocolError};

/// The command failure behind `err`, whether raised directly or wrapped in
/// a `FluidicsError`.
fn command_error(err: &eyre::Report) -> Option<&CommandError> {
    err.chain().find_map(|e| {
        e.downcast_ref::<CommandError>().or_else(|| match e.downcast_ref::<FluidicsError>() {
            Some(FluidicsError::Command(c)) => Some(c),
            _ => None,
        })
    })
}

fn fluidics_error(err: &eyre::Report) -> Option<&FluidicsError> {
    err.chain().find_map(|e| e.downcast_ref::<FluidicsError>())
}

fn humanize_command(ce: &CommandError) -> String {
    match ce {
        CommandError::Protocol {
            address,
            opcode,
            source,
        } => {
            let hint = match source {
                ProtocolError::BadIndex => {
                    "Check the output index in address_map and run `init-board` so the IN pins are outputs."
                }
                ProtocolError::UnknownCommand
                | ProtocolError::BadValue
                | ProtocolError::BadPacketSize
                | ProtocolError::MaxPayloadExceeded => {
                    "The board firmware may not match this tool; compare `info` output with the expected protocol version."
                }
                _ => "Power-cycle the board and retry; run `info` to confirm it answers.",
            };
            format!(
                "What happened: Board {address:#04x} rejected {opcode} with {source}.\nLikely causes: Misconfigured pin modes or firmware mismatch.\nHow to fix: {hint}"
            )
        }
        CommandError::Bus(msg) => format!(
            "What happened: I2C transfer failed ({msg}).\nLikely causes: Wrong board address, loose wiring, or the board is unpowered.\nHow to fix: Check address_map and cabling, then run `self-check`."
        ),
        CommandError::Decode(msg) => format!(
            "What happened: A board sent a reply that could not be decoded ({msg}).\nLikely causes: Bus noise or two boards sharing an address.\nHow to fix: Retry; if it persists, run `info` on each board and check for address clashes."
        ),
    }
}

/// Map an eyre::Report to a human-readable explanation with likely causes and fix hints.
pub fn humanize(err: &eyre::Report) -> String {
    if let Some(ce) = command_error(err) {
        return humanize_command(ce);
    }

    if let Some(fe) = fluidics_error(err) {
        return match fe {
            FluidicsError::UnknownStep(label) => format!(
                "What happened: No step is labelled '{label}'.\nLikely causes: Typo in the label or the step is missing from [[steps]].\nHow to fix: Run `fluidics steps` to list valid labels."
            ),
            FluidicsError::Config(msg) => format!(
                "What happened: Invalid configuration ({msg}).\nLikely causes: A step refers to a letter or index that address_map does not provide.\nHow to fix: Edit the TOML config and try again."
            ),
            FluidicsError::Switch(msg) => format!(
                "What happened: A local GPIO switch could not be set ({msg}).\nLikely causes: Pin in use by another process or insufficient GPIO permissions.\nHow to fix: Check the switch pins in [[steps]] and run with access to /dev/gpiomem."
            ),
            FluidicsError::Command(_) => format!(
                "What happened: {fe}.\nLikely causes: See logs.\nHow to fix: Re-run with --log-level=debug or set RUST_LOG for more detail."
            ),
        };
    }

    // String-based heuristics for errors coming from config loading and setup
    let msg = format!("{err:#}");
    let lower = msg.to_ascii_lowercase();

    if lower.contains("read config") {
        return format!(
            "What happened: The config file could not be read ({msg}).\nLikely causes: Wrong --config path or missing permissions.\nHow to fix: Pass --config pointing at an existing TOML file."
        );
    }

    if lower.contains("parse config") || lower.contains("invalid configuration") {
        return format!(
            "What happened: Configuration is invalid or incomplete ({msg}).\nLikely causes: Missing address_map entries, unknown step labels, or out-of-range values.\nHow to fix: Edit the TOML config and try again."
        );
    }

    if lower.contains("open i2c") {
        return "What happened: Failed to open the I2C bus.\nLikely causes: I2C not enabled or wrong bus.i2c_bus.\nHow to fix: Enable I2C (raspi-config), check bus.i2c_bus, and ensure the user can open /dev/i2c-N.".to_string();
    }

    // Generic fallback
    format!(
        "Something went wrong.\nHow to fix: Re-run with --log-level=debug for details. Original: {msg}"
    )
}

/// Stable exit codes: 3 unknown step, 4 board rejected a command, 5 bus or
/// decode failure, 1 for everything else.
pub fn exit_code_for_error(err: &eyre::Report) -> i32 {
    if let Some(ce) = command_error(err) {
        return match ce {
            CommandError::Protocol { .. } => 4,
            CommandError::Bus(_) | CommandError::Decode(_) => 5,
        };
    }
    match fluidics_error(err) {
        Some(FluidicsError::UnknownStep(_)) => 3,
        _ => 1,
    }
}

/// Structured JSON for errors when --json is enabled.
pub fn format_error_json(err: &eyre::Report) -> String {
    use serde_json::json;

    let kind = match (command_error(err), fluidics_error(err)) {
        (Some(CommandError::Protocol { .. }), _) => "protocol",
        (Some(CommandError::Bus(_)), _) => "bus",
        (Some(CommandError::Decode(_)), _) => "decode",
        (None, Some(FluidicsError::UnknownStep(_))) => "unknown_step",
        (None, Some(FluidicsError::Config(_))) => "config",
        (None, Some(FluidicsError::Switch(_))) => "switch",
        _ => "error",
    };
    let mut obj = json!({
        "error": kind,
        "message": format!("{err:#}"),
        "exit_code": exit_code_for_error(err),
    });
    if let Some(CommandError::Protocol {
        address,
        opcode,
        source,
    }) = command_error(err)
    {
        obj["details"] = json!({
            "address": address,
            "opcode": opcode.name(),
            "return_code": source.code(),
            "return_name": source.name(),
        });
    }
    obj.to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use fluidics_core::Opcode;

    fn rejected() -> eyre::Report {
        eyre::Report::new(FluidicsError::from(CommandError::Protocol {
            address: 0x11,
            opcode: Opcode::DigitalWrite,
            source: ProtocolError::BadIndex,
        }))
    }

    #[test]
    fn protocol_failure_is_explained_and_coded() {
        let err = rejected();
        let text = humanize(&err);
        assert!(text.contains("0x11"), "{text}");
        assert!(text.contains("init-board"), "{text}");
        assert_eq!(exit_code_for_error(&err), 4);
    }

    #[test]
    fn bare_command_error_is_found() {
        let err = eyre::Report::new(CommandError::Bus("nack".into()));
        assert_eq!(exit_code_for_error(&err), 5);
        assert!(humanize(&err).contains("self-check"));
    }

    #[test]
    fn unknown_step_json() {
        let err = eyre::Report::new(FluidicsError::UnknownStep("nope".into()));
        let v: serde_json::Value = serde_json::from_str(&format_error_json(&err)).unwrap();
        assert_eq!(v["error"], "unknown_step");
        assert_eq!(v["exit_code"], 3);
    }

    #[test]
    fn protocol_json_carries_return_code() {
        let v: serde_json::Value = serde_json::from_str(&format_error_json(&rejected())).unwrap();
        assert_eq!(v["error"], "protocol");
        assert_eq!(v["details"]["address"], 17);
        assert_eq!(v["details"]["return_name"], "RETURN_BAD_INDEX");
    }

    #[test]
    fn config_messages_fall_back_to_heuristics() {
        let err = eyre::eyre!("duplicate label 'x'").wrap_err("invalid configuration");
        let text = humanize(&err);
        assert!(text.starts_with("What happened: Configuration is invalid"));
        assert!(text.contains("duplicate label"));
        assert_eq!(exit_code_for_error(&err), 1);
    }
}
