//! Command execution.

use crate::Commands;
use canboot_client::{Client, ClientError, FirmwareImage, FlashPhase};
use canboot_hal::CanInterface;
use canboot_protocol::MAX_NODE_ID;
use canboot_storage::ConfigPatch;
use colored::Colorize;
use serde_json::Value;
use std::collections::BTreeMap;
use std::io::Read;
use std::path::Path;

/// Executes a command and returns the formatted output.
pub fn execute<B: CanInterface>(
    client: &mut Client<B>,
    cmd: Commands,
) -> Result<String, Box<dyn std::error::Error>> {
    match cmd {
        Commands::Ping { ids } => {
            let online = client.ping(&ids)?;
            let offline: Vec<u8> = ids.iter().copied().filter(|id| !online.contains(id)).collect();

            let mut output = format!("{} {}", "Online:".green(), format_ids(&online));
            if !offline.is_empty() {
                output.push_str(&format!("\n{} {}", "Offline:".red(), format_ids(&offline)));
            }
            Ok(output)
        }

        Commands::Scan => {
            let online = client.scan()?;
            if online.is_empty() {
                return Ok("No nodes found".yellow().to_string());
            }
            Ok(format!(
                "{} {} node(s): {}",
                "Found".green(),
                online.len(),
                format_ids(&online)
            ))
        }

        Commands::ReadConfig { ids, all } => {
            let ids: Vec<u8> = if all {
                client.scan()?.into_iter().collect()
            } else {
                ids
            };
            if ids.is_empty() {
                return Ok("No nodes to read".yellow().to_string());
            }
            let configs = client.read_config(&ids)?;
            Ok(format_configs(&configs))
        }

        Commands::WriteConfig { config, ids } => {
            let json = match config {
                Some(path) => std::fs::read_to_string(path)?,
                None => {
                    let mut buf = String::new();
                    std::io::stdin().read_to_string(&mut buf)?;
                    buf
                }
            };
            let patch = parse_patch(&json)?;
            client.write_config(&ids, &patch)?;
            Ok(format!("{} config of {}", "Updated".green(), format_ids(&ids)))
        }

        Commands::ChangeId { old, new } => {
            client.change_id(old, new)?;
            Ok(format!("{} node {} to {}", "Moved".green(), old, new.to_string().cyan()))
        }

        Commands::Flash {
            binary,
            base_address,
            device_class,
            page_size,
            run,
            ids,
        } => {
            let image = FirmwareImage::new(read_binary(&binary)?, base_address, device_class)
                .with_page_size(page_size);

            let online = client.ping(&ids)?;
            let offline: Vec<u8> = ids.iter().copied().filter(|id| !online.contains(id)).collect();
            if !offline.is_empty() {
                return Err(ClientError::Offline(offline).into());
            }

            eprintln!("Flashing firmware (size: {} bytes)", image.binary.len());
            client.flash(&image, &ids, report_progress)?;
            eprintln!();

            eprintln!("Verifying firmware...");
            let valid = client.verify(&image.binary, base_address, &ids)?;
            let failed: Vec<u8> = ids.iter().copied().filter(|id| !valid.contains(id)).collect();
            if !failed.is_empty() {
                return Err(ClientError::VerifyFailed(failed).into());
            }

            if run {
                client.run_application(&ids)?;
            }
            Ok("OK".green().to_string())
        }

        Commands::Verify {
            binary,
            base_address,
            ids,
        } => {
            let binary = read_binary(&binary)?;
            let valid = client.verify(&binary, base_address, &ids)?;
            let failed: Vec<u8> = ids.iter().copied().filter(|id| !valid.contains(id)).collect();
            if failed.is_empty() {
                Ok("OK".green().to_string())
            } else {
                Err(ClientError::VerifyFailed(failed).into())
            }
        }

        Commands::Run { ids, all } => {
            let ids: Vec<u8> = if all {
                (1..=MAX_NODE_ID).collect()
            } else {
                ids
            };
            client.run_application(&ids)?;
            Ok(String::new())
        }
    }
}

fn report_progress(phase: FlashPhase, done: usize, total: usize) {
    let label = match phase {
        FlashPhase::Erase => "Erasing",
        FlashPhase::Write => "Writing",
        FlashPhase::Config => "Saving config",
    };
    eprint!("\r{:<14} {:>8}/{} bytes", label, done, total);
}

fn read_binary(path: &Path) -> Result<Vec<u8>, Box<dyn std::error::Error>> {
    std::fs::read(path).map_err(|e| format!("cannot read '{}': {}", path.display(), e).into())
}

/// Parses an address in hex, with or without a `0x` prefix.
pub fn parse_address(s: &str) -> Result<u32, String> {
    let digits = s
        .strip_prefix("0x")
        .or_else(|| s.strip_prefix("0X"))
        .unwrap_or(s);
    u32::from_str_radix(digits, 16).map_err(|e| format!("invalid address '{}': {}", s, e))
}

/// Parses a JSON map of config keys.
fn parse_patch(json: &str) -> Result<ConfigPatch, Box<dyn std::error::Error>> {
    let value: Value = serde_json::from_str(json)?;
    if !value.is_object() {
        return Err("config must be a JSON map, e.g. {\"name\": \"foo\"}".into());
    }
    Ok(serde_json::from_value(value)?)
}

fn format_ids<'a>(ids: impl IntoIterator<Item = &'a u8>) -> String {
    let ids: Vec<String> = ids.into_iter().map(|id| id.to_string()).collect();
    if ids.is_empty() {
        "none".to_string()
    } else {
        ids.join(" ")
    }
}

/// Formats configs as a JSON object keyed by node id.
fn format_configs(configs: &BTreeMap<u8, Value>) -> String {
    let object: serde_json::Map<String, Value> = configs
        .iter()
        .map(|(id, config)| (id.to_string(), config.clone()))
        .collect();
    let value = Value::Object(object);
    serde_json::to_string_pretty(&value).unwrap_or_else(|_| value.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_parse_address() {
        assert_eq!(parse_address("0x08002000").unwrap(), 0x0800_2000);
        assert_eq!(parse_address("8002000").unwrap(), 0x0800_2000);
        assert_eq!(parse_address("0XfF").unwrap(), 0xff);
        assert!(parse_address("0x").is_err());
        assert!(parse_address("zz").is_err());
    }

    #[test]
    fn test_parse_patch() {
        let patch = parse_patch(r#"{"name": "foo", "application_size": 12, "extra": 1}"#).unwrap();
        assert_eq!(patch.board_name.as_deref(), Some("foo"));
        assert_eq!(patch.application_size, Some(12));
        assert_eq!(patch.id, None);

        let patch = parse_patch(r#"{"ID": 4}"#).unwrap();
        assert_eq!(patch.id, Some(4));

        assert!(parse_patch("[1, 2]").is_err());
        assert!(parse_patch("{").is_err());
    }

    #[test]
    fn test_format_configs() {
        let mut configs = BTreeMap::new();
        configs.insert(2, json!({"ID": 2}));
        configs.insert(10, json!({"ID": 10}));

        let output = format_configs(&configs);
        let parsed: Value = serde_json::from_str(&output).unwrap();
        assert_eq!(parsed["2"]["ID"], 2);
        assert_eq!(parsed["10"]["ID"], 10);
    }

    #[test]
    fn test_format_ids() {
        assert_eq!(format_ids(&[1u8, 5, 9]), "1 5 9");
        assert_eq!(format_ids(&Vec::<u8>::new()), "none");
    }

    #[test]
    fn test_read_binary() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("app.bin");
        std::fs::write(&path, [1, 2, 3]).unwrap();
        assert_eq!(read_binary(&path).unwrap(), vec![1, 2, 3]);

        let err = read_binary(&dir.path().join("missing.bin")).unwrap_err();
        assert!(err.to_string().contains("missing.bin"));
    }
}
