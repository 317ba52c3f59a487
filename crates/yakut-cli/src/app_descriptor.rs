//! Application package descriptors used by the file server to decide whether
//! a node needs a software update.
//!
//! Package files are named
//! `NAME-HW_MAJ.HW_MIN-SW_MAJ.SW_MIN.SW_VCS.SW_CRC.app*`, e.g.
//! `com.zubax.telega-1.2-0.3.68620b82.28df0c432c2718cd.app.bin`. The hardware
//! version may be partially or entirely omitted when the package suits several
//! hardware revisions; the CRC, or both the VCS hash and the CRC, may be omitted
//! when irrelevant.

use std::fmt;
use std::sync::LazyLock;

use regex::Regex;
use yakut_node::NodeInfo;

#[allow(clippy::expect_used)] // literal patterns, compiled in tests
static RE_FILE_NAME: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)^([\w.]+)(?:-(\d+)(?:\.(\d+))?)?-(\d+)\.(\d+)(?:\.([0-9a-f]+)(?:\.([0-9a-f]+))?)?\.app")
        .expect("pattern is valid")
});

/// Name and versions of an application, from a file name or a running node.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AppDescriptor {
    /// Lower-case node name.
    pub name: String,
    /// Hardware major version, if restricted.
    pub hw_major: Option<u8>,
    /// Hardware minor version, if restricted.
    pub hw_minor: Option<u8>,
    /// Software major version.
    pub sw_major: u8,
    /// Software minor version.
    pub sw_minor: u8,
    /// VCS revision, if known.
    pub sw_vcs: Option<u64>,
    /// Image CRC, if known.
    pub sw_crc: Option<u64>,
}

/// Properties undefined on either side match anything.
fn compatible<T: PartialEq>(a: Option<T>, b: Option<T>) -> bool {
    match (a, b) {
        (Some(a), Some(b)) => a == b,
        _ => true,
    }
}

impl AppDescriptor {
    /// Parses a package file name; `None` if it does not follow the pattern.
    #[must_use]
    pub fn from_file_name(file_name: &str) -> Option<Self> {
        let caps = RE_FILE_NAME.captures(file_name)?;
        let dec = |i: usize| caps.get(i).map(|m| m.as_str().parse::<u8>().ok());
        let hex = |i: usize| caps.get(i).map(|m| u64::from_str_radix(m.as_str(), 16).ok());
        Some(Self {
            name: caps.get(1)?.as_str().to_lowercase(),
            hw_major: dec(2).map_or(Some(None), |x| x.map(Some))?,
            hw_minor: dec(3).map_or(Some(None), |x| x.map(Some))?,
            sw_major: dec(4)??,
            sw_minor: dec(5)??,
            sw_vcs: hex(6).map_or(Some(None), |x| x.map(Some))?,
            sw_crc: hex(7).map_or(Some(None), |x| x.map(Some))?,
        })
    }

    /// Describes the application a node reports; zero versions, VCS and CRC
    /// count as undefined.
    #[must_use]
    pub fn from_node_info(info: &NodeInfo) -> Self {
        let hw = info.hardware_version;
        let has_hw = hw.major > 0 || hw.minor > 0;
        Self {
            name: info.name.trim().to_lowercase(),
            hw_major: has_hw.then_some(hw.major),
            hw_minor: has_hw.then_some(hw.minor),
            sw_major: info.software_version.major,
            sw_minor: info.software_version.minor,
            sw_vcs: Some(info.software_vcs_revision_id).filter(|x| *x != 0),
            sw_crc: info.software_image_crc.filter(|x| *x != 0),
        }
    }

    /// Whether updating `self` to `other` would be pointless.
    #[must_use]
    pub fn is_equivalent(&self, other: &Self) -> bool {
        let verdict = if self.name != other.name {
            "a different application"
        } else if !compatible(self.hw_major, other.hw_major) || !compatible(self.hw_minor, other.hw_minor) {
            "a different hardware version"
        } else if self.sw_major != other.sw_major || self.sw_minor != other.sw_minor {
            "a different software version"
        } else if !compatible(self.sw_vcs, other.sw_vcs) || !compatible(self.sw_crc, other.sw_crc) {
            "a different VCS revision or CRC"
        } else {
            tracing::info!(app = %self, other = %other, "equivalent, an update would be meaningless");
            return true;
        };
        tracing::info!(app = %self, other = %other, "not equivalent: {verdict}");
        false
    }

    /// Whether a node running `self` should be updated to `other`: the
    /// hardware must match, then a different CRC always warrants an update,
    /// and otherwise the other version must be newer or from another revision.
    #[must_use]
    pub fn should_update_to(&self, other: &Self) -> bool {
        let (update, reason) = if self.name != other.name {
            (false, "a different application")
        } else if !compatible(self.hw_major, other.hw_major) || !compatible(self.hw_minor, other.hw_minor) {
            (false, "the hardware does not match, an update might brick the node")
        } else if matches!((self.sw_crc, other.sw_crc), (Some(a), Some(b)) if a != b) {
            (true, "the CRC differs")
        } else if (self.sw_major, self.sw_minor) > (other.sw_major, other.sw_minor) {
            (false, "the other application is older")
        } else if (self.sw_major, self.sw_minor) != (other.sw_major, other.sw_minor)
            || matches!((self.sw_vcs, other.sw_vcs), (Some(a), Some(b)) if a != b)
        {
            (true, "a different version that is not older")
        } else {
            (false, "the same version")
        };
        tracing::info!(app = %self, other = %other, update, "{reason}");
        update
    }

    /// Glob for pre-selecting candidate packages in a directory listing.
    #[must_use]
    pub fn glob_prefix(&self) -> String {
        format!("{}-", self.name)
    }

    /// Whether `file_name` passes the `NAME-*.app*` pre-selection.
    #[must_use]
    pub fn prefilter(&self, file_name: &str) -> bool {
        file_name.to_lowercase().starts_with(&self.glob_prefix()) && file_name.to_lowercase().contains(".app")
    }
}

impl fmt::Display for AppDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name)?;
        if let Some(maj) = self.hw_major {
            write!(f, "-{maj}")?;
            if let Some(min) = self.hw_minor {
                write!(f, ".{min}")?;
            }
        }
        write!(f, "-{}.{}", self.sw_major, self.sw_minor)?;
        if let Some(vcs) = self.sw_vcs {
            write!(f, ".{vcs:016x}")?;
            if let Some(crc) = self.sw_crc {
                write!(f, ".{crc:016x}")?;
            }
        }
        f.write_str(".app")
    }
}

#[cfg(test)]
mod tests {
    use yakut_node::info::Version;

    use super::*;

    fn ffn(s: &str) -> AppDescriptor {
        AppDescriptor::from_file_name(s).expect(s)
    }

    #[test]
    fn file_names_round_trip_to_canonical_form() {
        let cases = [
            (
                "org.opencyphal.NODE-16.17-26.27.123456.DEADBEEF.application.bin",
                "org.opencyphal.node-16.17-26.27.0000000000123456.00000000deadbeef.app",
            ),
            (
                "org.opencyphal.NODE-16-26.27.123456.DEADBEEF.application.bin",
                "org.opencyphal.node-16-26.27.0000000000123456.00000000deadbeef.app",
            ),
            (
                "org.opencyphal.NODE-26.27.123456.application.bin",
                "org.opencyphal.node-26.27.0000000000123456.app",
            ),
            ("org.opencyphal.NODE-26.27.app", "org.opencyphal.node-26.27.app"),
            ("org.opencyphal.NODE-16.17-26.27.app", "org.opencyphal.node-16.17-26.27.app"),
        ];
        for (name, canonical) in cases {
            assert_eq!(ffn(name).to_string(), canonical);
        }
        assert_eq!(AppDescriptor::from_file_name("org.opencyphal.node-z-26.27.app"), None);
        assert_eq!(
            AppDescriptor::from_file_name("org.opencyphal.NODE-16.17-26.27.123456.DEADBEEF.bin"),
            None
        );
    }

    #[test]
    fn node_info_zeros_are_undefined() {
        let mut info = NodeInfo {
            hardware_version: Version { major: 16, minor: 17 },
            software_version: Version { major: 26, minor: 27 },
            software_vcs_revision_id: 0x12_3456,
            name: "org.opencyphal.NODE ".into(),
            software_image_crc: Some(0xDEAD_BEEF),
            ..NodeInfo::default()
        };
        let ad = AppDescriptor::from_node_info(&info);
        assert_eq!(ad.to_string(), "org.opencyphal.node-16.17-26.27.0000000000123456.00000000deadbeef.app");

        info.hardware_version = Version::default();
        info.software_vcs_revision_id = 0;
        info.software_image_crc = None;
        let ad = AppDescriptor::from_node_info(&info);
        assert_eq!((ad.hw_major, ad.hw_minor, ad.sw_vcs, ad.sw_crc), (None, None, None, None));
        assert_eq!(ad.to_string(), "org.opencyphal.node-26.27.app");
    }

    #[test]
    fn missing_properties_are_equivalent() {
        let full = ffn("z-1.2-3.4.a.b.app");
        for other in ["z-1.2-3.4.a.b.app", "z-1.2-3.4.a.app", "z-1.2-3.4.app", "z-1-3.4.app", "z-3.4.app"] {
            assert!(ffn(other).is_equivalent(&full), "{other}");
            assert!(full.is_equivalent(&ffn(other)), "{other}");
        }
        for other in [
            "x-1.2-3.4.a.b.app",
            "z-2.2-3.4.a.b.app",
            "z-1.3-3.4.a.b.app",
            "z-1.2-4.4.a.b.app",
            "z-1.2-3.3.a.b.app",
            "z-1.2-3.4.c.b.app",
            "z-1.2-3.4.a.c.app",
        ] {
            assert!(!full.is_equivalent(&ffn(other)), "{other}");
        }
    }

    #[test]
    fn update_decisions() {
        let base = ffn("z-1.2-3.4.a.b.app");
        for other in [
            "z-1.2-4.4.a.b.app",
            "z-1.2-3.5.a.b.app",
            "z-1.2-3.3.a.c.app",
            "z-3.3.a.c.app",
            "z-1.2-3.4.c.b.app",
            "z-1.2-3.4.c.app",
        ] {
            assert!(base.should_update_to(&ffn(other)), "{other}");
        }
        assert!(ffn("z-1.2-3.4.a.app").should_update_to(&ffn("z-1.2-3.4.c.b.app")));
        for other in [
            "z-1.2-3.4.a.b.app",
            "z-1.2-3.3.a.b.app",
            "z-1.2-2.4.a.b.app",
            "x-1.2-3.3.a.c.app",
            "x-1.3-3.3.a.c.app",
            "x-2.2-3.3.a.c.app",
        ] {
            assert!(!base.should_update_to(&ffn(other)), "{other}");
        }
    }

    #[test]
    fn prefilter_matches_name_and_suffix() {
        let ad = ffn("com.example.node-1.0.app");
        assert!(ad.prefilter("com.example.node-2.0.app.bin"));
        assert!(!ad.prefilter("com.example.nodex-2.0.app.bin"));
        assert!(!ad.prefilter("com.example.node-2.0.bin"));
    }

    #[test]
    fn patterns_compile() {
        let _ = LazyLock::force(&RE_FILE_NAME);
    }
}
