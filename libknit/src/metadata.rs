//! Where descriptors of classes come from. Classes declared by the sources in a job are discovered
//! by reading them, but library classes are supplied by a `MetadataLoader`.

use crate::class::ClassDescriptor;
use crate::classfile::parse_class;
use crate::error::Context as _;
use crate::name::ClassName;
use indexmap::IndexMap;
use std::path::PathBuf;
use std::sync::Arc;

pub trait MetadataLoader: Send + Sync {
    fn lookup(&self, name: &ClassName) -> Result<Arc<ClassDescriptor>, LookupError>;
}

#[derive(Debug, thiserror::Error)]
pub enum LookupError {
    #[error("class `{0}` was not found")]
    NotFound(ClassName),

    #[error("{0:#}")]
    Load(anyhow::Error),
}

/// Loads classes from binary class files found under a list of directories. Directories are
/// searched in order and the first file found is used.
#[derive(Debug, Default, Clone)]
pub struct ClassPathLoader {
    roots: Vec<PathBuf>,
}

/// A fixed set of classes held in memory. Iteration follows insertion order.
#[derive(Debug, Default, Clone)]
pub struct InMemoryLoader {
    classes: IndexMap<ClassName, Arc<ClassDescriptor>>,
}

impl ClassPathLoader {
    pub fn new(roots: Vec<PathBuf>) -> Self {
        Self { roots }
    }
}

impl MetadataLoader for ClassPathLoader {
    fn lookup(&self, name: &ClassName) -> Result<Arc<ClassDescriptor>, LookupError> {
        let relative = format!("{name}.class");
        let Some(path) = self
            .roots
            .iter()
            .map(|root| root.join(&relative))
            .find(|path| path.is_file())
        else {
            return Err(LookupError::NotFound(name.clone()));
        };
        tracing::debug!(class = %name, path = %path.display(), "Loading class file");
        let load = || -> crate::error::Result<ClassDescriptor> {
            let bytes = std::fs::read(&path)?;
            let class = parse_class(&bytes)?;
            if class.name() != name {
                anyhow::bail!("File declares class `{}` instead", class.name());
            }
            Ok(class)
        };
        load()
            .with_context(|| format!("Failed to load `{name}` from `{}`", path.display()))
            .map(Arc::new)
            .map_err(LookupError::Load)
    }
}

impl InMemoryLoader {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a class, returning any class with the same name that it replaced.
    pub fn insert(&mut self, class: Arc<ClassDescriptor>) -> Option<Arc<ClassDescriptor>> {
        self.classes.insert(class.name().clone(), class)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Arc<ClassDescriptor>> {
        self.classes.values()
    }
}

impl FromIterator<Arc<ClassDescriptor>> for InMemoryLoader {
    fn from_iter<T: IntoIterator<Item = Arc<ClassDescriptor>>>(iter: T) -> Self {
        let mut loader = InMemoryLoader::new();
        for class in iter {
            loader.insert(class);
        }
        loader
    }
}

impl MetadataLoader for InMemoryLoader {
    fn lookup(&self, name: &ClassName) -> Result<Arc<ClassDescriptor>, LookupError> {
        self.classes
            .get(name)
            .cloned()
            .ok_or_else(|| LookupError::NotFound(name.clone()))
    }
}
