//! Description decoder.
//!
//! Decoding runs in three passes: JSON syntax, then per-field presence and
//! type checks while walking the tree, then cross-field rules on the typed
//! result. Every error carries the path of the field that caused it.

use serde_json::{Map, Value};
use std::path::PathBuf;

use crate::error::{ConfigError, ConfigErrorKind, ParseError};
use crate::{
    BlockConfig, ConsoleConfig, CpuConfig, DeviceConfig, LinuxConfig, MemoryConfig, NetConfig,
    OsConfig, VfioConfig, VmDescription, VmmConfig, MAX_VCPUS,
};

type Result<T> = std::result::Result<T, ConfigError>;

/// Path used for errors about the document itself.
const ROOT: &str = "description";

pub(crate) fn parse_description(text: &str) -> std::result::Result<VmDescription, ParseError> {
    let value: Value = serde_json::from_str(text)?;
    let description = decode_description(value)?;
    check_cross_fields(&description)?;
    Ok(description)
}

/// A JSON object being consumed field by field.
///
/// Fields are removed as they are read, so whatever is left at
/// [`Fields::finish`] is unknown to the format.
struct Fields {
    path: String,
    map: Map<String, Value>,
}

impl Fields {
    fn new(path: impl Into<String>, value: Value) -> Result<Self> {
        let path = path.into();
        match value {
            Value::Object(map) => Ok(Self { path, map }),
            _ => Err(ConfigError::new(path, ConfigErrorKind::WrongType("object"))),
        }
    }

    fn child(&self, key: &str) -> String {
        if self.path == ROOT {
            key.to_string()
        } else {
            format!("{}.{}", self.path, key)
        }
    }

    /// Remove a field, treating `null` as absent.
    fn take(&mut self, key: &str) -> Option<Value> {
        match self.map.remove(key) {
            Some(Value::Null) | None => None,
            Some(value) => Some(value),
        }
    }

    fn required(&mut self, key: &str) -> Result<Value> {
        self.take(key)
            .ok_or_else(|| ConfigError::new(self.child(key), ConfigErrorKind::Missing))
    }

    fn object(&mut self, key: &str) -> Result<Fields> {
        let value = self.required(key)?;
        Fields::new(self.child(key), value)
    }

    /// Open a variant's `specific` payload. Its fields are addressed directly
    /// under the owner (`os.kernel_path`, not `os.specific.kernel_path`).
    fn specific(&mut self) -> Result<Fields> {
        let value = self.required("specific")?;
        match value {
            Value::Object(map) => Ok(Fields {
                path: self.path.clone(),
                map,
            }),
            _ => Err(ConfigError::new(
                self.child("specific"),
                ConfigErrorKind::WrongType("object"),
            )),
        }
    }

    fn positive_u32(&mut self, key: &str, max: u32) -> Result<u32> {
        let path = self.child(key);
        let number = match self.required(key)? {
            Value::Number(n) => n,
            _ => return Err(ConfigError::new(path, ConfigErrorKind::WrongType("positive integer"))),
        };

        if let Some(v) = number.as_u64() {
            if v >= 1 && v <= u64::from(max) {
                return Ok(v as u32);
            }
            return Err(ConfigError::new(
                path,
                ConfigErrorKind::Invalid(format!("must be between 1 and {}", max)),
            ));
        }
        if number.is_i64() {
            return Err(ConfigError::new(
                path,
                ConfigErrorKind::Invalid("must be a positive integer".into()),
            ));
        }
        Err(ConfigError::new(path, ConfigErrorKind::WrongType("positive integer")))
    }

    fn string(&mut self, key: &str) -> Result<String> {
        let value = self.required(key)?;
        self.as_string(key, value)
    }

    fn optional_string(&mut self, key: &str) -> Result<Option<String>> {
        match self.take(key) {
            Some(value) => self.as_string(key, value).map(Some),
            None => Ok(None),
        }
    }

    fn as_string(&self, key: &str, value: Value) -> Result<String> {
        match value {
            Value::String(s) => Ok(s),
            _ => Err(ConfigError::new(self.child(key), ConfigErrorKind::WrongType("string"))),
        }
    }

    fn path(&mut self, key: &str) -> Result<PathBuf> {
        let s = self.string(key)?;
        self.non_empty_path(key, s)
    }

    fn optional_path(&mut self, key: &str) -> Result<Option<PathBuf>> {
        match self.optional_string(key)? {
            Some(s) => self.non_empty_path(key, s).map(Some),
            None => Ok(None),
        }
    }

    fn non_empty_path(&self, key: &str, s: String) -> Result<PathBuf> {
        if s.is_empty() {
            return Err(ConfigError::new(
                self.child(key),
                ConfigErrorKind::Invalid("path must not be empty".into()),
            ));
        }
        Ok(PathBuf::from(s))
    }

    fn optional_bool(&mut self, key: &str) -> Result<Option<bool>> {
        match self.take(key) {
            Some(Value::Bool(b)) => Ok(Some(b)),
            Some(_) => Err(ConfigError::new(self.child(key), ConfigErrorKind::WrongType("boolean"))),
            None => Ok(None),
        }
    }

    fn optional_array(&mut self, key: &str) -> Result<Vec<Value>> {
        match self.take(key) {
            Some(Value::Array(items)) => Ok(items),
            Some(_) => Err(ConfigError::new(self.child(key), ConfigErrorKind::WrongType("array"))),
            None => Ok(Vec::new()),
        }
    }

    /// Reject any field that was not consumed.
    fn finish(self) -> Result<()> {
        match self.map.keys().next() {
            Some(key) => {
                let path = if self.path == ROOT {
                    key.clone()
                } else {
                    format!("{}.{}", self.path, key)
                };
                Err(ConfigError::new(path, ConfigErrorKind::UnknownField))
            }
            None => Ok(()),
        }
    }
}

fn decode_description(value: Value) -> Result<VmDescription> {
    let mut root = Fields::new(ROOT, value)?;

    let cpu = decode_cpu(root.object("cpu")?)?;
    let memory = decode_memory(root.object("memory")?)?;

    let mut device = Vec::new();
    for (index, entry) in root.optional_array("device")?.into_iter().enumerate() {
        device.push(decode_device(index, entry)?);
    }

    let os = decode_os(root.object("os")?)?;

    let vmm = match root.take("vmm") {
        Some(Value::Object(map)) => VmmConfig(map),
        Some(_) => {
            return Err(ConfigError::new("vmm", ConfigErrorKind::WrongType("object")));
        }
        None => VmmConfig::default(),
    };

    root.finish()?;

    Ok(VmDescription {
        cpu,
        memory,
        device,
        os,
        vmm,
    })
}

fn decode_cpu(mut fields: Fields) -> Result<CpuConfig> {
    let count = fields.positive_u32("count", MAX_VCPUS)?;
    fields.finish()?;
    Ok(CpuConfig { count })
}

fn decode_memory(mut fields: Fields) -> Result<MemoryConfig> {
    let size_mib = fields.positive_u32("size_mib", u32::MAX)?;
    fields.finish()?;
    Ok(MemoryConfig { size_mib })
}

fn decode_device(index: usize, value: Value) -> Result<DeviceConfig> {
    let mut entry = Fields::new(format!("device[{}]", index), value)?;
    let driver = entry.string("driver")?;

    // The tag is checked before the payload so an unknown driver is reported
    // as such rather than as a payload mismatch.
    if !DeviceConfig::DRIVERS.contains(&driver.as_str()) {
        return Err(ConfigError::new(
            entry.child("driver"),
            ConfigErrorKind::UnknownDriver(driver),
        ));
    }

    let mut specific = entry.specific()?;
    let config = match driver.as_str() {
        "virtio-blk" => DeviceConfig::VirtioBlk(BlockConfig {
            source: specific.path("source")?,
            read_only: specific.optional_bool("read_only")?.unwrap_or(false),
        }),
        "virtio-net" => DeviceConfig::VirtioNet(NetConfig {
            mac: specific.string("mac")?,
            tap: specific.optional_string("tap")?,
        }),
        "vfio" => DeviceConfig::Vfio(VfioConfig {
            source: specific.string("source")?,
        }),
        "console" => DeviceConfig::Console(ConsoleConfig {
            kind: specific.string("type")?,
        }),
        other => {
            return Err(ConfigError::new(
                entry.child("driver"),
                ConfigErrorKind::UnknownDriver(other.to_string()),
            ))
        }
    };
    specific.finish()?;
    entry.finish()?;

    Ok(config)
}

fn decode_os(mut fields: Fields) -> Result<OsConfig> {
    let os_type = fields.string("type")?;
    if !OsConfig::TYPES.contains(&os_type.as_str()) {
        return Err(ConfigError::new(
            fields.child("type"),
            ConfigErrorKind::UnknownOsType(os_type),
        ));
    }

    let mut specific = fields.specific()?;
    let linux = LinuxConfig {
        kernel_path: specific.path("kernel_path")?,
        initrd_path: specific.optional_path("initrd_path")?,
        rootfs_path: specific.optional_path("rootfs_path")?,
        cmd_args: specific.optional_string("cmd_args")?.unwrap_or_default(),
    };
    specific.finish()?;
    fields.finish()?;

    Ok(OsConfig::Linux(linux))
}

fn check_cross_fields(description: &VmDescription) -> Result<()> {
    match &description.os {
        OsConfig::Linux(linux) => {
            if linux.rootfs_path.is_none() && linux.initrd_path.is_none() {
                return Err(ConfigError::new(
                    "os.rootfs_path",
                    ConfigErrorKind::Invalid(
                        "required unless os.initrd_path is set".to_string(),
                    ),
                ));
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    const FULL: &str = r#"{
        "cpu": { "count": 2 },
        "memory": { "size_mib": 256 },
        "device": [
            { "driver": "virtio-blk", "specific": { "source": "/var/lib/disk.img", "read_only": true } },
            { "driver": "virtio-net", "specific": { "mac": "52:54:00:12:34:56", "tap": "tap0" } },
            { "driver": "vfio", "specific": { "source": "0000:00:1f.2" } },
            { "driver": "console", "specific": { "type": "serial" } }
        ],
        "os": {
            "type": "Linux",
            "specific": {
                "kernel_path": "/boot/vmlinux",
                "initrd_path": null,
                "rootfs_path": "/var/lib/rootfs.img",
                "cmd_args": "console=ttyS0 reboot=k"
            }
        },
        "vmm": {}
    }"#;

    fn minimal_with(os_specific: &str) -> String {
        format!(
            r#"{{ "cpu": {{ "count": 1 }}, "memory": {{ "size_mib": 64 }},
                 "os": {{ "type": "Linux", "specific": {} }} }}"#,
            os_specific
        )
    }

    fn config_error(text: &str) -> ConfigError {
        match parse_description(text) {
            Err(ParseError::Config(e)) => e,
            other => panic!("expected config error, got {:?}", other),
        }
    }

    #[test]
    fn test_parse_full_description() {
        let desc = parse_description(FULL).unwrap();
        assert_eq!(desc.cpu.count, 2);
        assert_eq!(desc.memory.size_mib, 256);
        assert_eq!(desc.device.len(), 4);
        assert_eq!(
            desc.device[0],
            DeviceConfig::VirtioBlk(BlockConfig {
                source: PathBuf::from("/var/lib/disk.img"),
                read_only: true,
            })
        );
        assert_eq!(desc.device[3].driver(), "console");

        let OsConfig::Linux(linux) = &desc.os;
        assert_eq!(linux.kernel_path, PathBuf::from("/boot/vmlinux"));
        assert_eq!(linux.initrd_path, None);
        assert_eq!(linux.cmd_args, "console=ttyS0 reboot=k");
    }

    #[test]
    fn test_device_list_may_be_absent_or_empty() {
        let desc = parse_description(&minimal_with(r#"{ "kernel_path": "/k", "rootfs_path": "/r" }"#))
            .unwrap();
        assert!(desc.device.is_empty());
        assert_eq!(desc.vmm, VmmConfig::default());
    }

    #[test]
    fn test_round_trip_preserves_fields() {
        let desc = parse_description(FULL).unwrap();
        let text = desc.to_json_pretty().unwrap();
        let again = parse_description(&text).unwrap();
        assert_eq!(desc, again);
    }

    #[test]
    fn test_syntax_error_reports_position() {
        match parse_description("{ \"cpu\": { \"count\": 1 }\n  \"memory\" }") {
            Err(ParseError::Syntax { line, .. }) => assert_eq!(line, 2),
            other => panic!("expected syntax error, got {:?}", other),
        }
    }

    #[test]
    fn test_missing_kernel_path() {
        let err = config_error(&minimal_with(r#"{ "rootfs_path": "/r" }"#));
        assert_eq!(err.path, "os.kernel_path");
        assert_eq!(err.kind, ConfigErrorKind::Missing);
        assert_eq!(err.to_string(), "os.kernel_path: required field missing");
    }

    #[test]
    fn test_unknown_driver_names_index() {
        let text = r#"{ "cpu": { "count": 1 }, "memory": { "size_mib": 64 },
            "device": [
                { "driver": "console", "specific": { "type": "serial" } },
                { "driver": "console", "specific": { "type": "serial" } },
                { "driver": "foo", "specific": {} }
            ],
            "os": { "type": "Linux", "specific": { "kernel_path": "/k", "rootfs_path": "/r" } } }"#;
        let err = config_error(text);
        assert_eq!(err.to_string(), "device[2].driver: unknown driver \"foo\"");
    }

    #[test]
    fn test_rejects_invalid_fields() {
        // (text, expected path, description)
        let cases = [
            (
                r#"{ "cpu": { "count": 0 }, "memory": { "size_mib": 64 }, "os": { "type": "Linux", "specific": { "kernel_path": "/k", "rootfs_path": "/r" } } }"#,
                "cpu.count",
                "zero vcpus",
            ),
            (
                r#"{ "cpu": { "count": 513 }, "memory": { "size_mib": 64 }, "os": { "type": "Linux", "specific": { "kernel_path": "/k", "rootfs_path": "/r" } } }"#,
                "cpu.count",
                "too many vcpus",
            ),
            (
                r#"{ "cpu": { "count": 1.5 }, "memory": { "size_mib": 64 }, "os": { "type": "Linux", "specific": { "kernel_path": "/k", "rootfs_path": "/r" } } }"#,
                "cpu.count",
                "fractional count",
            ),
            (
                r#"{ "cpu": { "count": 1 }, "memory": { "size_mib": -4 }, "os": { "type": "Linux", "specific": { "kernel_path": "/k", "rootfs_path": "/r" } } }"#,
                "memory.size_mib",
                "negative memory",
            ),
            (
                r#"{ "cpu": { "count": 1 }, "memory": { "size_mib": 64 }, "os": { "type": "Linux", "specific": { "kernel_path": "/k", "rootfs_path": "/r" } }, "extra": 1 }"#,
                "extra",
                "unknown top-level key",
            ),
            (
                r#"{ "cpu": { "count": 1, "threads": 2 }, "memory": { "size_mib": 64 }, "os": { "type": "Linux", "specific": { "kernel_path": "/k", "rootfs_path": "/r" } } }"#,
                "cpu.threads",
                "unknown nested key",
            ),
            (
                r#"{ "cpu": { "count": 1 }, "memory": { "size_mib": 64 }, "os": { "type": "Windows", "specific": {} } }"#,
                "os.type",
                "unknown os type",
            ),
            (
                r#"{ "cpu": { "count": 1 }, "memory": { "size_mib": 64 }, "device": [ { "driver": "virtio-net", "specific": {} } ], "os": { "type": "Linux", "specific": { "kernel_path": "/k", "rootfs_path": "/r" } } }"#,
                "device[0].mac",
                "missing mac",
            ),
            (
                r#"{ "cpu": { "count": 1 }, "memory": { "size_mib": 64 }, "device": [ { "driver": "console" } ], "os": { "type": "Linux", "specific": { "kernel_path": "/k", "rootfs_path": "/r" } } }"#,
                "device[0].specific",
                "missing specific",
            ),
            (
                r#"{ "cpu": { "count": 1 }, "memory": { "size_mib": 64 }, "vmm": [], "os": { "type": "Linux", "specific": { "kernel_path": "/k", "rootfs_path": "/r" } } }"#,
                "vmm",
                "vmm not an object",
            ),
            (
                r#"{ "memory": { "size_mib": 64 }, "os": { "type": "Linux", "specific": { "kernel_path": "/k", "rootfs_path": "/r" } } }"#,
                "cpu",
                "missing cpu",
            ),
            ("[]", "description", "not an object"),
        ];

        for (text, path, desc) in cases {
            let err = config_error(text);
            assert_eq!(err.path, path, "{}", desc);
        }
    }

    #[test]
    fn test_rootfs_required_without_initrd() {
        let err = config_error(&minimal_with(r#"{ "kernel_path": "/k" }"#));
        assert_eq!(err.path, "os.rootfs_path");

        let desc = parse_description(&minimal_with(r#"{ "kernel_path": "/k", "initrd_path": "/i" }"#))
            .unwrap();
        let OsConfig::Linux(linux) = &desc.os;
        assert_eq!(linux.rootfs_path, None);
        assert_eq!(linux.initrd_path, Some(PathBuf::from("/i")));
    }

    #[test]
    fn test_from_file_reports_io_error() {
        let err = VmDescription::from_file("/nonexistent/shuairan/vm.json").unwrap_err();
        assert!(matches!(err, ParseError::Io { .. }));
        assert!(err.to_string().contains("/nonexistent/shuairan/vm.json"));
    }
}
