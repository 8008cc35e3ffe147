use std::fmt::{Display, Formatter};
use std::ops::{BitAnd, BitOr, BitOrAssign, Not};

/// One independently stored unit of a command history record.
#[derive(Debug, Clone, Copy, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub enum Fragment {
    Core,
    Audit,
    Status,
    Export,
}

impl Fragment {
    pub const ALL: [Fragment; 4] = [Self::Core, Self::Audit, Self::Status, Self::Export];

    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Core => "core",
            Self::Audit => "audit",
            Self::Status => "status",
            Self::Export => "export",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "core" => Some(Self::Core),
            "audit" => Some(Self::Audit),
            "status" => Some(Self::Status),
            "export" | "exportdestinations" => Some(Self::Export),
            _ => None,
        }
    }

    #[must_use]
    pub fn as_set(self) -> FragmentSet {
        match self {
            Self::Core => FragmentSet::CORE,
            Self::Audit => FragmentSet::AUDIT,
            Self::Status => FragmentSet::STATUS,
            Self::Export => FragmentSet::EXPORT,
        }
    }
}

/// Bitmask addressing a subset of fragments.
#[derive(Debug, Clone, Copy, Eq, PartialEq, Hash, Default)]
pub struct FragmentSet(u8);

impl FragmentSet {
    pub const NONE: Self = Self(0);
    pub const CORE: Self = Self(0b0001);
    pub const AUDIT: Self = Self(0b0010);
    pub const STATUS: Self = Self(0b0100);
    pub const EXPORT: Self = Self(0b1000);
    pub const ALL: Self = Self(0b1111);

    #[must_use]
    pub fn is_empty(self) -> bool {
        self.0 == 0
    }

    #[must_use]
    pub fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }

    #[must_use]
    pub fn has(self, fragment: Fragment) -> bool {
        self.contains(fragment.as_set())
    }

    #[must_use]
    pub fn union(self, other: Self) -> Self {
        Self(self.0 | other.0)
    }

    #[must_use]
    pub fn intersection(self, other: Self) -> Self {
        Self(self.0 & other.0)
    }

    #[must_use]
    pub fn difference(self, other: Self) -> Self {
        Self(self.0 & !other.0)
    }

    pub fn iter(self) -> impl Iterator<Item = Fragment> {
        Fragment::ALL
            .into_iter()
            .filter(move |fragment| self.has(*fragment))
    }

    /// Parses `all`, `none`, or a comma separated fragment list.
    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "all" => return Some(Self::ALL),
            "none" => return Some(Self::NONE),
            _ => {}
        }

        let mut set = Self::NONE;
        for part in value.split(',').filter(|part| !part.trim().is_empty()) {
            set |= Fragment::parse(part)?.as_set();
        }
        Some(set)
    }
}

impl From<Fragment> for FragmentSet {
    fn from(fragment: Fragment) -> Self {
        fragment.as_set()
    }
}

impl BitOr for FragmentSet {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self::Output {
        self.union(rhs)
    }
}

impl BitOrAssign for FragmentSet {
    fn bitor_assign(&mut self, rhs: Self) {
        *self = self.union(rhs);
    }
}

impl BitAnd for FragmentSet {
    type Output = Self;

    fn bitand(self, rhs: Self) -> Self::Output {
        self.intersection(rhs)
    }
}

impl Not for FragmentSet {
    type Output = Self;

    fn not(self) -> Self::Output {
        Self(!self.0 & Self::ALL.0)
    }
}

impl Display for FragmentSet {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        if self.is_empty() {
            return f.write_str("none");
        }
        if *self == Self::ALL {
            return f.write_str("all");
        }

        let names = self.iter().map(Fragment::as_str).collect::<Vec<_>>();
        f.write_str(&names.join("|"))
    }
}
