use std::fmt::Display;
use std::sync::Arc;

/// The name of a class-like unit, e.g. `pkg/sub/Foo`. Names may be written with either `.` or `/`
/// as the package separator, but we always store the slashed form, so both spellings compare and
/// hash equal.
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ClassName {
    normalized: Arc<str>,
}

impl ClassName {
    pub fn new(name: &str) -> ClassName {
        let normalized = if name.contains('.') {
            Arc::from(name.replace('.', "/"))
        } else {
            Arc::from(name)
        };
        ClassName { normalized }
    }

    pub fn as_str(&self) -> &str {
        &self.normalized
    }

    /// The name without its package, e.g. `Foo` for `pkg/Foo`.
    pub fn simple_name(&self) -> &str {
        self.normalized
            .rsplit_once('/')
            .map_or(&*self.normalized, |(_, simple)| simple)
    }

    /// The package, e.g. `pkg/sub` for `pkg/sub/Foo`. Empty for classes in the default package.
    pub fn package(&self) -> &str {
        self.normalized
            .rsplit_once('/')
            .map_or("", |(package, _)| package)
    }

    /// The type descriptor for an instance of this class, e.g. `Lpkg/Foo;`.
    pub fn descriptor(&self) -> String {
        format!("L{};", self.normalized)
    }
}

impl Display for ClassName {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        Display::fmt(&self.normalized, f)
    }
}

impl std::fmt::Debug for ClassName {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "`{}`", self.normalized)
    }
}
