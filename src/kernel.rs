//! Kernel source scanning.
//!
//! A [`KernelSource`] is produced once when a kernel is loaded.  It
//! keeps the WGSL text untouched for compilation and records the few
//! facts the orchestration layer needs from it: which buffer bindings
//! the kernel declares (and under which variable names), the declared
//! `@workgroup_size`, and the names of its `@compute` entry points.
//! Comments are stripped before scanning so commented-out declarations
//! never produce bindings.  Nothing here validates the kernel; invalid
//! WGSL is reported by the backend when a pipeline is first built.

use std::fmt;
use std::sync::LazyLock;

use regex::Regex;

// A run of attributes followed by a `var<space[, access]> name`.
static VAR_DECL: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"((?:@\w+\s*\([^)]*\)\s*)+)var\s*<\s*(\w+)\s*(?:,\s*(\w+)\s*)?>\s*(\w+)")
        .expect("valid regex")
});
static GROUP_ATTR: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"@group\s*\(\s*(\d+)\s*\)").expect("valid regex"));
static BINDING_ATTR: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"@binding\s*\(\s*(\d+)\s*\)").expect("valid regex"));
static WORKGROUP_ATTR: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"@workgroup_size\s*\(([^)]*)\)").expect("valid regex"));
static COMPUTE_FN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"@compute\b[^{;]*?\bfn\s+(\w+)").expect("valid regex"));

/// How a kernel accesses a bound buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BindingKind {
    /// `var<storage>` or `var<storage, read>`.
    ReadOnlyStorage,
    /// `var<storage, read_write>`.
    Storage,
    /// `var<uniform>`.
    Uniform,
}

impl BindingKind {
    fn from_decl(space: &str, access: Option<&str>) -> Option<Self> {
        match (space, access) {
            ("storage", None | Some("read")) => Some(Self::ReadOnlyStorage),
            ("storage", Some(_)) => Some(Self::Storage),
            ("uniform", _) => Some(Self::Uniform),
            _ => None,
        }
    }

    /// The matching wgpu bind group layout entry type.
    pub fn buffer_binding_type(self) -> wgpu::BufferBindingType {
        match self {
            Self::ReadOnlyStorage => wgpu::BufferBindingType::Storage { read_only: true },
            Self::Storage => wgpu::BufferBindingType::Storage { read_only: false },
            Self::Uniform => wgpu::BufferBindingType::Uniform,
        }
    }
}

/// One `@group(g) @binding(b) var<...> name` declaration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BindingDecl {
    pub group: u32,
    pub binding: u32,
    pub name: String,
    pub kind: BindingKind,
}

/// The three dimensions of `@workgroup_size`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WorkgroupSize {
    pub x: u32,
    pub y: u32,
    pub z: u32,
}

impl WorkgroupSize {
    /// Used when the kernel has no parseable `@workgroup_size`.
    pub const DEFAULT: Self = Self { x: 256, y: 1, z: 1 };

    /// Invocations per work group.
    pub fn invocations(&self) -> u64 {
        u64::from(self.x) * u64::from(self.y) * u64::from(self.z)
    }

    /// Parses the argument list of `@workgroup_size(...)`.  Between one
    /// and three positive integer literals are accepted, with missing
    /// dimensions defaulting to 1.  Overridable constants and other
    /// expressions are not evaluated and yield `None`.
    fn parse_args(args: &str) -> Option<Self> {
        let dims = args
            .split(',')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(|s| s.trim_end_matches(['u', 'i']).parse::<u32>().ok().filter(|&v| v > 0))
            .collect::<Option<Vec<_>>>()?;
        match dims.as_slice() {
            [x] => Some(Self { x: *x, y: 1, z: 1 }),
            [x, y] => Some(Self { x: *x, y: *y, z: 1 }),
            [x, y, z] => Some(Self { x: *x, y: *y, z: *z }),
            _ => None,
        }
    }
}

impl Default for WorkgroupSize {
    fn default() -> Self {
        Self::DEFAULT
    }
}

impl fmt::Display for WorkgroupSize {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "({}, {}, {})", self.x, self.y, self.z)
    }
}

/// Kernel text plus the declaration table scanned from it.
#[derive(Debug, Clone, Default)]
pub struct KernelSource {
    text: String,
    bindings: Vec<BindingDecl>,
    workgroup_size: WorkgroupSize,
    entry_points: Vec<String>,
}

impl KernelSource {
    /// Scans `text` once.  Never fails: anything that cannot be
    /// understood is simply absent from the resulting table.
    pub fn parse(text: impl Into<String>) -> Self {
        let text = text.into();
        let stripped = strip_comments(&text);

        let mut bindings: Vec<BindingDecl> = Vec::new();
        for caps in VAR_DECL.captures_iter(&stripped) {
            let attrs = &caps[1];
            let Some(kind) = BindingKind::from_decl(&caps[2], caps.get(3).map(|m| m.as_str())) else {
                continue;
            };
            let (Some(group), Some(binding)) = (attr_value(&GROUP_ATTR, attrs), attr_value(&BINDING_ATTR, attrs))
            else {
                continue;
            };
            if bindings.iter().any(|b| b.group == group && b.binding == binding) {
                log::warn!("kernel declares @group({group}) @binding({binding}) more than once; keeping the first");
                continue;
            }
            bindings.push(BindingDecl { group, binding, name: caps[4].to_string(), kind });
        }
        bindings.sort_by_key(|b| (b.group, b.binding));

        let workgroup_size = WORKGROUP_ATTR
            .captures(&stripped)
            .and_then(|caps| WorkgroupSize::parse_args(&caps[1]))
            .unwrap_or_default();

        let entry_points = COMPUTE_FN
            .captures_iter(&stripped)
            .map(|caps| caps[1].to_string())
            .collect();

        Self { text, bindings, workgroup_size, entry_points }
    }

    pub fn text(&self) -> &str {
        &self.text
    }

    /// True when no text was loaded.  Whitespace-only text counts as a
    /// kernel and fails when its pipeline is built.
    pub fn is_empty(&self) -> bool {
        self.text.is_empty()
    }

    /// All buffer declarations, ordered by `(group, binding)`.
    pub fn bindings(&self) -> &[BindingDecl] {
        &self.bindings
    }

    pub fn workgroup_size(&self) -> WorkgroupSize {
        self.workgroup_size
    }

    /// Names of the `@compute` functions, in source order.
    pub fn entry_points(&self) -> &[String] {
        &self.entry_points
    }

    /// Resolves a variable name to its declaration.
    pub fn find(&self, tag: &str) -> Option<&BindingDecl> {
        self.bindings.iter().find(|b| b.name == tag)
    }

    /// The group 0 declaration at `slot`, if any.
    pub fn slot(&self, slot: u32) -> Option<&BindingDecl> {
        self.bindings.iter().find(|b| b.group == 0 && b.binding == slot)
    }

    /// Declarations that must have a buffer bound before dispatch.
    pub fn required(&self) -> impl Iterator<Item = &BindingDecl> {
        self.bindings.iter()
    }
}

/// Replaces every comment with a single space.  `//` runs to the end of
/// the line and `/* */` nests, so whichever opener comes first wins and
/// an opener inside a comment has no effect.  An unterminated block
/// comment runs to the end of the text.
fn strip_comments(text: &str) -> String {
    let bytes = text.as_bytes();
    let mut out = String::with_capacity(text.len());
    let mut start = 0;
    let mut i = 0;
    while i + 1 < bytes.len() {
        match (bytes[i], bytes[i + 1]) {
            (b'/', b'/') => {
                out.push_str(&text[start..i]);
                out.push(' ');
                i = text[i..].find('\n').map_or(bytes.len(), |n| i + n);
                start = i;
            }
            (b'/', b'*') => {
                out.push_str(&text[start..i]);
                out.push(' ');
                let mut depth = 1;
                i += 2;
                while depth > 0 && i < bytes.len() {
                    match (bytes[i], bytes.get(i + 1)) {
                        (b'/', Some(b'*')) => {
                            depth += 1;
                            i += 2;
                        }
                        (b'*', Some(b'/')) => {
                            depth -= 1;
                            i += 2;
                        }
                        _ => i += 1,
                    }
                }
                start = i;
            }
            _ => i += 1,
        }
    }
    out.push_str(&text[start.min(text.len())..]);
    out
}

fn attr_value(re: &Regex, attrs: &str) -> Option<u32> {
    re.captures(attrs).and_then(|caps| caps[1].parse().ok())
}
