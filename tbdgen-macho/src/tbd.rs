//! The `.tbd` render state and text serializer.
//!
//! A [`TbdRecord`] is populated in place by the Mach-O image parser, adjusted
//! by the caller's field edits, and then rendered to the text-based stub
//! format consumed by the static linker.

use std::io::{self, Write};

use bitflags::bitflags;
use uuid::Uuid;

bitflags! {
    /// Options honored by [`TbdRecord::write_to`].
    #[derive(Default)]
    pub struct TbdWriteOptions: u32 {
        const IGNORE_UUIDS = 1 << 0;
        /// Suppress the trailing `...` document terminator. Used when many
        /// documents are combined into one file; the terminator is then
        /// written once via [`write_footer`].
        const IGNORE_FOOTER = 1 << 1;
        const IGNORE_CLIENTS = 1 << 2;
        const IGNORE_COMPATIBILITY_VERSION = 1 << 3;
        const IGNORE_CURRENT_VERSION = 1 << 4;
        const IGNORE_EXPORTS = 1 << 5;
        const IGNORE_OBJC_CONSTRAINT = 1 << 6;
        const IGNORE_PARENT_UMBRELLA = 1 << 7;
        const IGNORE_REEXPORTS = 1 << 8;
        const IGNORE_SWIFT_VERSION = 1 << 9;
    }
}

bitflags! {
    /// The `flags` field of a `.tbd` document.
    #[derive(Default)]
    pub struct TbdFlags: u32 {
        const FLAT_NAMESPACE = 1 << 0;
        const NOT_APP_EXTENSION_SAFE = 1 << 1;
    }
}

impl TbdFlags {
    pub const NAMES: &'static [(&'static str, TbdFlags)] = &[
        ("flat_namespace", TbdFlags::FLAT_NAMESPACE),
        ("not_app_extension_safe", TbdFlags::NOT_APP_EXTENSION_SAFE),
    ];

    pub fn from_name(name: &str) -> Option<TbdFlags> {
        Self::NAMES
            .iter()
            .find(|(n, _)| *n == name)
            .map(|(_, f)| *f)
    }

    fn names(self) -> Vec<&'static str> {
        Self::NAMES
            .iter()
            .filter(|(_, f)| self.contains(*f))
            .map(|(n, _)| *n)
            .collect()
    }
}

/// The version of the `.tbd` text format to emit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default)]
pub enum TbdVersion {
    V1,
    #[default]
    V2,
    V3,
}

impl TbdVersion {
    pub const ALL: &'static [TbdVersion] = &[TbdVersion::V1, TbdVersion::V2, TbdVersion::V3];

    pub fn name(self) -> &'static str {
        match self {
            TbdVersion::V1 => "v1",
            TbdVersion::V2 => "v2",
            TbdVersion::V3 => "v3",
        }
    }

    pub fn from_name(name: &str) -> Option<TbdVersion> {
        Self::ALL.iter().copied().find(|v| v.name() == name)
    }

    fn document_header(self) -> &'static str {
        match self {
            TbdVersion::V1 => "---",
            TbdVersion::V2 => "--- !tapi-tbd-v2",
            TbdVersion::V3 => "--- !tapi-tbd-v3",
        }
    }
}

/// The platform a `.tbd` document targets.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Platform {
    MacOsx,
    Ios,
    Watchos,
    Tvos,
    Bridgeos,
    MacCatalyst,
    IosSimulator,
    TvosSimulator,
    WatchosSimulator,
}

impl Platform {
    pub const ALL: &'static [Platform] = &[
        Platform::MacOsx,
        Platform::Ios,
        Platform::Watchos,
        Platform::Tvos,
        Platform::Bridgeos,
        Platform::MacCatalyst,
        Platform::IosSimulator,
        Platform::TvosSimulator,
        Platform::WatchosSimulator,
    ];

    pub fn name(self) -> &'static str {
        match self {
            Platform::MacOsx => "macosx",
            Platform::Ios => "ios",
            Platform::Watchos => "watchos",
            Platform::Tvos => "tvos",
            Platform::Bridgeos => "bridgeos",
            Platform::MacCatalyst => "maccatalyst",
            Platform::IosSimulator => "ios-simulator",
            Platform::TvosSimulator => "tvos-simulator",
            Platform::WatchosSimulator => "watchos-simulator",
        }
    }

    pub fn from_name(name: &str) -> Option<Platform> {
        Self::ALL.iter().copied().find(|p| p.name() == name)
    }

    /// Maps an `LC_BUILD_VERSION` platform value.
    pub fn from_build_version(platform: u32) -> Option<Platform> {
        use object::macho::*;
        let p = match platform {
            PLATFORM_MACOS => Platform::MacOsx,
            PLATFORM_IOS => Platform::Ios,
            PLATFORM_TVOS => Platform::Tvos,
            PLATFORM_WATCHOS => Platform::Watchos,
            PLATFORM_BRIDGEOS => Platform::Bridgeos,
            PLATFORM_MACCATALYST => Platform::MacCatalyst,
            PLATFORM_IOSSIMULATOR => Platform::IosSimulator,
            PLATFORM_TVOSSIMULATOR => Platform::TvosSimulator,
            PLATFORM_WATCHOSSIMULATOR => Platform::WatchosSimulator,
            _ => return None,
        };
        Some(p)
    }
}

/// The `objc-constraint` field of a `.tbd` document.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ObjcConstraint {
    None,
    RetainRelease,
    RetainReleaseForSimulator,
    RetainReleaseOrGc,
    Gc,
}

impl ObjcConstraint {
    pub const ALL: &'static [ObjcConstraint] = &[
        ObjcConstraint::None,
        ObjcConstraint::RetainRelease,
        ObjcConstraint::RetainReleaseForSimulator,
        ObjcConstraint::RetainReleaseOrGc,
        ObjcConstraint::Gc,
    ];

    pub fn name(self) -> &'static str {
        match self {
            ObjcConstraint::None => "none",
            ObjcConstraint::RetainRelease => "retain_release",
            ObjcConstraint::RetainReleaseForSimulator => "retain_release_for_simulator",
            ObjcConstraint::RetainReleaseOrGc => "retain_release_or_gc",
            ObjcConstraint::Gc => "gc",
        }
    }

    pub fn from_name(name: &str) -> Option<ObjcConstraint> {
        Self::ALL.iter().copied().find(|c| c.name() == name)
    }
}

/// A Mach-O packed version number, `xxxx.yy.zz` in 16.8.8 bits.
#[derive(Debug, Clone, Copy, Default)]
pub struct PackedVersion(pub u32);

impl std::fmt::Display for PackedVersion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let major = self.0 >> 16;
        let minor = (self.0 >> 8) & 0xff;
        let patch = self.0 & 0xff;
        if patch != 0 {
            write!(f, "{major}.{minor}.{patch}")
        } else if minor != 0 {
            write!(f, "{major}.{minor}")
        } else {
            write!(f, "{major}")
        }
    }
}

/// One `exports` entry: the symbols exported for a set of architectures.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExportGroup {
    pub archs: Vec<String>,
    pub clients: Vec<String>,
    pub reexports: Vec<String>,
    pub symbols: Vec<String>,
    pub objc_classes: Vec<String>,
    pub objc_ivars: Vec<String>,
    pub weak_symbols: Vec<String>,
}

impl ExportGroup {
    pub fn new(arch: &str) -> ExportGroup {
        ExportGroup {
            archs: vec![arch.to_string()],
            ..Default::default()
        }
    }

    /// True when the group carries nothing the linker could use.
    pub fn is_empty(&self) -> bool {
        self.clients.is_empty()
            && self.reexports.is_empty()
            && self.symbols.is_empty()
            && self.objc_classes.is_empty()
            && self.objc_ivars.is_empty()
            && self.weak_symbols.is_empty()
    }

    pub(crate) fn sort_and_dedup(&mut self) {
        for list in [
            &mut self.archs,
            &mut self.clients,
            &mut self.reexports,
            &mut self.symbols,
            &mut self.objc_classes,
            &mut self.objc_ivars,
            &mut self.weak_symbols,
        ] {
            list.sort_unstable();
            list.dedup();
        }
    }

    /// Whether two groups export the same set of names, ignoring archs.
    pub fn same_contents(&self, other: &ExportGroup) -> bool {
        self.clients == other.clients
            && self.reexports == other.reexports
            && self.symbols == other.symbols
            && self.objc_classes == other.objc_classes
            && self.objc_ivars == other.objc_ivars
            && self.weak_symbols == other.weak_symbols
    }
}

/// The render state for one `.tbd` document.
#[derive(Debug, Clone, Default)]
pub struct TbdRecord {
    pub version: TbdVersion,
    pub archs: Vec<String>,
    /// Per-arch UUIDs, in arch order.
    pub uuids: Vec<(String, Uuid)>,
    pub platform: Option<Platform>,
    pub flags: TbdFlags,
    pub install_name: Option<String>,
    pub current_version: Option<PackedVersion>,
    pub compatibility_version: Option<PackedVersion>,
    pub swift_version: Option<u32>,
    pub objc_constraint: Option<ObjcConstraint>,
    pub parent_umbrella: Option<String>,
    pub exports: Vec<ExportGroup>,
}

impl TbdRecord {
    pub fn new(version: TbdVersion) -> TbdRecord {
        TbdRecord {
            version,
            ..Default::default()
        }
    }

    /// Restores the record to `base` between images, keeping the `exports`
    /// allocation alive across images.
    pub fn clear_for_next_image(&mut self, base: &TbdRecord) {
        let mut exports = std::mem::take(&mut self.exports);
        exports.clear();
        *self = base.clone();
        self.exports = exports;
    }

    /// True when at least one export group would be written out.
    pub fn has_exports(&self) -> bool {
        self.exports.iter().any(|group| !group.is_empty())
    }

    /// Sorts and dedups all list-valued fields so that output is
    /// deterministic regardless of the order the parser discovered names in.
    pub fn normalize(&mut self) {
        self.archs.sort_unstable();
        self.archs.dedup();
        self.uuids.sort_unstable_by(|a, b| a.0.cmp(&b.0));
        for group in &mut self.exports {
            group.sort_and_dedup();
        }
        self.exports.retain(|group| !group.is_empty());
    }

    /// Renders the document to `w`.
    pub fn write_to<W: Write>(&self, w: &mut W, options: TbdWriteOptions) -> io::Result<()> {
        writeln!(w, "{}", self.version.document_header())?;
        write_string_list(w, "archs", &self.archs)?;

        if !options.contains(TbdWriteOptions::IGNORE_UUIDS) && !self.uuids.is_empty() {
            let rendered: Vec<String> = self
                .uuids
                .iter()
                .map(|(arch, uuid)| {
                    format!("'{}: {}'", arch, uuid.hyphenated().to_string().to_uppercase())
                })
                .collect();
            write_raw_list(w, "uuids", &rendered)?;
        }

        if let Some(platform) = self.platform {
            write_scalar(w, "platform", platform.name())?;
        }
        if !self.flags.is_empty() {
            write_raw_list(w, "flags", &self.flags.names())?;
        }
        if let Some(install_name) = &self.install_name {
            write_scalar(w, "install-name", &quote(install_name))?;
        }
        if let Some(version) = self.current_version {
            if !options.contains(TbdWriteOptions::IGNORE_CURRENT_VERSION) {
                write_scalar(w, "current-version", &version.to_string())?;
            }
        }
        if let Some(version) = self.compatibility_version {
            if !options.contains(TbdWriteOptions::IGNORE_COMPATIBILITY_VERSION) {
                write_scalar(w, "compatibility-version", &version.to_string())?;
            }
        }
        if let Some(swift_version) = self.swift_version {
            if !options.contains(TbdWriteOptions::IGNORE_SWIFT_VERSION) {
                write_scalar(w, "swift-version", &swift_version.to_string())?;
            }
        }
        if let Some(constraint) = self.objc_constraint {
            if !options.contains(TbdWriteOptions::IGNORE_OBJC_CONSTRAINT) {
                write_scalar(w, "objc-constraint", constraint.name())?;
            }
        }
        if let Some(umbrella) = &self.parent_umbrella {
            if !options.contains(TbdWriteOptions::IGNORE_PARENT_UMBRELLA) {
                write_scalar(w, "parent-umbrella", &quote(umbrella))?;
            }
        }

        if !options.contains(TbdWriteOptions::IGNORE_EXPORTS) && self.has_exports() {
            writeln!(w, "exports:")?;
            for group in self.exports.iter().filter(|group| !group.is_empty()) {
                write_group(w, group, options)?;
            }
        }

        if !options.contains(TbdWriteOptions::IGNORE_FOOTER) {
            write_footer(w)?;
        }
        Ok(())
    }
}

/// Writes the `...` document terminator.
pub fn write_footer<W: Write>(w: &mut W) -> io::Result<()> {
    writeln!(w, "...")
}

fn write_group<W: Write>(w: &mut W, group: &ExportGroup, options: TbdWriteOptions) -> io::Result<()> {
    let mut first = FirstLine::new(w);
    first.string_list("archs", &group.archs)?;
    if !options.contains(TbdWriteOptions::IGNORE_CLIENTS) {
        first.string_list("allowable-clients", &group.clients)?;
    }
    if !options.contains(TbdWriteOptions::IGNORE_REEXPORTS) {
        first.string_list("re-exports", &group.reexports)?;
    }
    first.string_list("symbols", &group.symbols)?;
    first.string_list("objc-classes", &group.objc_classes)?;
    first.string_list("objc-ivars", &group.objc_ivars)?;
    first.string_list("weak-def-symbols", &group.weak_symbols)?;
    Ok(())
}

/// Tracks the `  - ` prefix of the first line of a block-sequence entry.
struct FirstLine<'w, W: Write> {
    w: &'w mut W,
    first: bool,
}

impl<'w, W: Write> FirstLine<'w, W> {
    fn new(w: &'w mut W) -> FirstLine<'w, W> {
        FirstLine { w, first: true }
    }

    fn string_list(&mut self, key: &str, values: &[String]) -> io::Result<()> {
        if values.is_empty() {
            return Ok(());
        }
        let indent = if self.first { "  - " } else { "    " };
        self.first = false;
        let rendered: Vec<String> = values.iter().map(|v| quote(v)).collect();
        writeln!(self.w, "{indent}{} [ {} ]", padded_key(key), rendered.join(", "))
    }
}

fn write_scalar<W: Write>(w: &mut W, key: &str, value: &str) -> io::Result<()> {
    writeln!(w, "{} {}", padded_key(key), value)
}

fn write_string_list<W: Write>(w: &mut W, key: &str, values: &[String]) -> io::Result<()> {
    if values.is_empty() {
        return Ok(());
    }
    let rendered: Vec<String> = values.iter().map(|v| quote(v)).collect();
    writeln!(w, "{} [ {} ]", padded_key(key), rendered.join(", "))
}

fn write_raw_list<W: Write, S: AsRef<str>>(w: &mut W, key: &str, values: &[S]) -> io::Result<()> {
    if values.is_empty() {
        return Ok(());
    }
    let rendered: Vec<&str> = values.iter().map(|v| v.as_ref()).collect();
    writeln!(w, "{} [ {} ]", padded_key(key), rendered.join(", "))
}

/// `key:` padded so that values line up the way tapi writes them.
fn padded_key(key: &str) -> String {
    format!("{:<16}", format!("{key}:"))
}

/// Quotes a YAML scalar if it could otherwise be misread.
fn quote(value: &str) -> String {
    let plain = !value.is_empty()
        && value.bytes().all(|b| {
            b.is_ascii_alphanumeric() || matches!(b, b'_' | b'$' | b'.' | b'/' | b'+' | b'-' | b'@')
        })
        && !value.starts_with('-');
    if plain {
        value.to_string()
    } else {
        format!("'{}'", value.replace('\'', "''"))
    }
}
