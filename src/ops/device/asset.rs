//! The embedded kernel, treated as a versioned asset.
//!
//! The WGSL file starts with a `// key: value` header naming the kernel, its
//! version, its entry point and the workgroup size it was written for. The
//! header is parsed once and checked against the body, so the host never
//! has to hard-code anything about the source text.

use crate::error::DeviceError;

const APPLY_TRANSFORM_WGSL: &str = include_str!("../shaders/apply_transform.wgsl");

/// Largest source accepted, to keep an accidental blob out of the compiler.
const MAX_SOURCE_LEN: usize = 64 * 1024;

/// A parsed kernel asset.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KernelAsset {
    /// Kernel name, used for labels and diagnostics.
    pub name: String,
    /// Asset version from the header.
    pub version: u32,
    /// Entry point function.
    pub entry: String,
    /// Local group size the kernel declares.
    pub workgroup_size: u32,
    /// Full source text, header included.
    pub source: &'static str,
}

impl KernelAsset {
    /// Parses and validates an asset.
    ///
    /// # Errors
    ///
    /// [`DeviceError::Asset`] when a header key is missing or malformed, or
    /// when the body does not declare the entry point or workgroup size the
    /// header promises.
    pub fn parse(source: &'static str) -> Result<Self, DeviceError> {
        if source.len() > MAX_SOURCE_LEN {
            return Err(DeviceError::Asset(format!(
                "source is {} bytes, limit is {MAX_SOURCE_LEN}",
                source.len()
            )));
        }

        let mut name = None;
        let mut version = None;
        let mut entry = None;
        let mut workgroup_size = None;

        for line in source.lines().map(str::trim) {
            let Some(comment) = line.strip_prefix("//") else {
                break;
            };
            let Some((key, value)) = comment.split_once(':') else {
                continue;
            };
            let value = value.trim();
            match key.trim() {
                "kernel" => name = Some(value.to_string()),
                "version" => version = Some(parse_number("version", value)?),
                "entry" => entry = Some(value.to_string()),
                "workgroup_size" => workgroup_size = Some(parse_number("workgroup_size", value)?),
                _ => {}
            }
        }

        let name = name.ok_or_else(|| missing("kernel"))?;
        let version = version.ok_or_else(|| missing("version"))?;
        let entry = entry.ok_or_else(|| missing("entry"))?;
        let workgroup_size = workgroup_size.ok_or_else(|| missing("workgroup_size"))?;

        if workgroup_size == 0 {
            return Err(DeviceError::Asset("workgroup_size must be non-zero".into()));
        }
        if !source.contains(&format!("fn {entry}(")) {
            return Err(DeviceError::Asset(format!(
                "entry point `{entry}` is not defined"
            )));
        }
        if !source.contains(&format!("@workgroup_size({workgroup_size})")) {
            return Err(DeviceError::Asset(format!(
                "kernel does not declare @workgroup_size({workgroup_size})"
            )));
        }

        Ok(Self {
            name,
            version,
            entry,
            workgroup_size,
            source,
        })
    }

    /// `name@version`, used in logs.
    #[must_use]
    pub fn id(&self) -> String {
        format!("{}@{}", self.name, self.version)
    }
}

fn missing(key: &str) -> DeviceError {
    DeviceError::Asset(format!("header key `{key}` is missing"))
}

fn parse_number(key: &str, value: &str) -> Result<u32, DeviceError> {
    value
        .parse()
        .map_err(|_| DeviceError::Asset(format!("header key `{key}` is not a number: `{value}`")))
}

lazy_static::lazy_static! {
    static ref APPLY_TRANSFORM: Result<KernelAsset, DeviceError> = KernelAsset::parse(APPLY_TRANSFORM_WGSL);
}

/// The point-transform kernel, parsed on first use.
///
/// # Errors
///
/// [`DeviceError::Asset`] if the embedded file is malformed.
pub fn apply_transform() -> Result<&'static KernelAsset, DeviceError> {
    APPLY_TRANSFORM
        .as_ref()
        .map_err(|e| DeviceError::Asset(e.to_string()))
}
