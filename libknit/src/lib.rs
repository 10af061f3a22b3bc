use crate::args::Action;
use crate::args::Args;
use crate::class::ClassDescriptor;
use crate::discovery::discover;
use crate::error::Error;
use crate::error::LinkError;
use crate::error::Result;
use crate::metadata::ClassPathLoader;
use crate::metadata::LookupError;
use crate::metadata::MetadataLoader;
use crate::name::ClassName;
use crate::resolution::resolve_source;
use crate::resolver::DiscoveredClass;
use crate::resolver::Resolver;
use crate::rewrite::rewrite_source;
use crate::source::Source;
use crate::threading::TaskHandle;
use crate::threading::WorkerPool;
use itertools::Itertools;
use std::num::NonZeroUsize;
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::fmt;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

pub mod args;
pub mod class;
pub(crate) mod classfile;
pub(crate) mod directive;
pub(crate) mod discovery;
pub mod error;
pub mod line_table;
pub mod member;
pub mod metadata;
pub mod name;
pub mod reference;
pub mod resolution;
pub mod resolver;
pub(crate) mod rewrite;
pub mod source;
pub(crate) mod threading;
pub(crate) mod timing;

pub use rewrite::LINE_SEPARATOR;

/// What to link.
#[derive(Default)]
pub struct LinkJob {
    /// Sources are processed in parallel, but this order is the order in which unqualified
    /// signatures search the job's classes.
    pub sources: Vec<Arc<Source>>,

    /// Library classes, loaded before resolution starts. Searched after the job's sources.
    pub libraries: Vec<ClassName>,

    /// Where references that resolve nowhere are sent.
    pub unresolved_target: Option<ClassName>,
}

#[derive(Debug, Clone)]
pub struct LinkerConfig {
    pub num_threads: NonZeroUsize,

    /// How long to wait for worker tasks to finish once the job is done.
    pub shutdown_timeout: Duration,

    /// The type that generated glue code asks for dependencies.
    pub context_class: ClassName,
}

pub struct Linker {
    loader: Arc<dyn MetadataLoader>,
    config: LinkerConfig,
}

impl Default for LinkerConfig {
    fn default() -> Self {
        LinkerConfig {
            num_threads: args::available_parallelism(),
            shutdown_timeout: args::DEFAULT_SHUTDOWN_TIMEOUT,
            context_class: ClassName::new(args::DEFAULT_CONTEXT_CLASS),
        }
    }
}

impl LinkerConfig {
    fn from_args(args: &Args) -> Self {
        LinkerConfig {
            num_threads: args.num_threads,
            shutdown_timeout: args.shutdown_timeout,
            context_class: ClassName::new(&args.context_class),
        }
    }
}

impl LinkJob {
    fn from_args(args: &Args) -> Self {
        LinkJob {
            sources: args
                .inputs
                .iter()
                .map(|(input, output)| Arc::new(Source::from_file(input, output.as_deref())))
                .collect(),
            libraries: args.libraries.iter().map(|l| ClassName::new(l)).collect(),
            unresolved_target: args.unresolved_target.as_deref().map(ClassName::new),
        }
    }
}

/// Runs the action described by our command-line arguments.
pub fn run(action: &Action) -> Result {
    match action {
        Action::Link(args) => {
            // Tracing might already be set up if we're being run more than once in the same
            // process, which is fine.
            if args.time_phases {
                let _ = timing::init_tracing();
            } else {
                let _ = tracing_subscriber::registry()
                    .with(fmt::layer())
                    .with(EnvFilter::from_default_env())
                    .try_init();
            }
            let loader = Arc::new(ClassPathLoader::new(args.class_path.clone()));
            Linker::new(loader, LinkerConfig::from_args(args)).link(&LinkJob::from_args(args))
        }
        Action::Version => {
            println!("knit version {}", env!("CARGO_PKG_VERSION"));
            Ok(())
        }
    }
}

impl Linker {
    pub fn new(loader: Arc<dyn MetadataLoader>, config: LinkerConfig) -> Self {
        Linker { loader, config }
    }

    /// Links every source in `job`, writing each one's output and closing it. On failure, no
    /// source that failed produces output, and the first error encountered is returned.
    #[tracing::instrument(skip_all, name = "Link", fields(sources = job.sources.len()))]
    pub fn link(&self, job: &LinkJob) -> Result {
        let pool = WorkerPool::new(self.config.num_threads)?;
        let outcome = self.link_with_pool(&pool, job);
        let faults = pool.shutdown(self.config.shutdown_timeout);
        // A panicking task never sends a result, so its handle already failed the link. Faults can
        // only outlive a successful link if a worker panicked outside of any task.
        match outcome {
            Ok(()) if !faults.is_empty() => Err(LinkError::WorkerFault(faults.join("; ")).into()),
            outcome => outcome,
        }
    }

    fn link_with_pool(&self, pool: &WorkerPool, job: &LinkJob) -> Result {
        let link_span = tracing::Span::current();

        let discoveries = job
            .sources
            .iter()
            .map(|source| {
                let source = source.clone();
                let span = link_span.clone();
                pool.submit(format!("discover {}", source.name()), move || {
                    span.in_scope(|| -> Result<DiscoveredClass> {
                        Ok(DiscoveredClass {
                            source: source.name().to_owned(),
                            class: Arc::new(discover(&source)?),
                        })
                    })
                })
            })
            .collect_vec();

        // Libraries are loaded here while the workers discover.
        let libraries = self.load_libraries(&job.libraries);

        let discovered = join_all(discoveries);
        let (discovered, libraries) = match (discovered, libraries) {
            (Ok(discovered), Ok(libraries)) => (discovered, libraries),
            (discovered, libraries) => {
                let errors = discovered
                    .err()
                    .into_iter()
                    .flatten()
                    .chain(libraries.err())
                    .collect_vec();
                abandon_all(job);
                return Err(first_error(errors));
            }
        };

        let classes = discovered.iter().map(|d| d.class.clone()).collect_vec();
        let resolver = match Resolver::new(
            discovered,
            libraries,
            self.loader.clone(),
            job.unresolved_target.clone(),
        ) {
            Ok(resolver) => Arc::new(resolver),
            Err(error) => {
                abandon_all(job);
                return Err(error);
            }
        };

        let links = job
            .sources
            .iter()
            .zip(classes)
            .map(|(source, class)| {
                let source = source.clone();
                let resolver = resolver.clone();
                let context = self.config.context_class.clone();
                let span = link_span.clone();
                pool.submit(format!("link {}", source.name()), move || {
                    span.in_scope(|| {
                        let outcome = link_source(&source, &class, &resolver, &context);
                        if outcome.is_err() {
                            source.abandon();
                        }
                        outcome
                    })
                })
            })
            .collect_vec();

        join_all(links).map(|_| ()).map_err(|errors| {
            // Tasks that panicked didn't get to abandon their sources. Sources that closed
            // successfully are unaffected.
            abandon_all(job);
            first_error(errors)
        })
    }

    #[tracing::instrument(skip_all, name = "Load libraries")]
    fn load_libraries(&self, names: &[ClassName]) -> Result<Vec<Arc<ClassDescriptor>>> {
        names
            .iter()
            .unique()
            .map(|name| {
                self.loader.lookup(name).map_err(|error| {
                    let message = match error {
                        LookupError::NotFound(_) => format!("library class `{name}` was not found"),
                        LookupError::Load(error) => {
                            format!("unable to load library class `{name}`: {error:#}")
                        }
                    };
                    Error::from(LinkError::Resolution(message))
                })
            })
            .collect()
    }
}

/// The second and third passes over a source, then closing it so that its output is kept.
fn link_source(
    source: &Source,
    class: &Arc<ClassDescriptor>,
    resolver: &Resolver,
    context: &ClassName,
) -> Result {
    let resolution = resolve_source(source, class, resolver, context)?;
    rewrite_source(source, &resolution)?;
    source.close()
}

/// Waits for all of `handles`. Returns either all their results, or the errors of all that failed.
fn join_all<T>(handles: Vec<TaskHandle<T>>) -> Result<Vec<T>, Vec<Error>> {
    let mut values = Vec::with_capacity(handles.len());
    let mut errors = Vec::new();
    for handle in handles {
        match handle.join() {
            Ok(value) => values.push(value),
            Err(error) => errors.push(error),
        }
    }
    if errors.is_empty() {
        Ok(values)
    } else {
        Err(errors)
    }
}

/// Logs all but the first of `errors`, then returns the first.
fn first_error(errors: Vec<Error>) -> Error {
    let mut errors = errors.into_iter();
    let Some(first) = errors.next() else {
        return LinkError::WorkerFault("task failed without an error".to_owned()).into();
    };
    for error in errors {
        tracing::error!("{error:#}");
    }
    first
}

fn abandon_all(job: &LinkJob) {
    for source in &job.sources {
        source.abandon();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metadata::InMemoryLoader;
    use crate::source::MemoryOutput;

    fn linker(loader: InMemoryLoader) -> Linker {
        Linker::new(
            Arc::new(loader),
            LinkerConfig {
                num_threads: NonZeroUsize::new(2).unwrap(),
                ..Default::default()
            },
        )
    }

    fn job(sources: &[(&str, &str)]) -> (LinkJob, Vec<MemoryOutput>) {
        let (sources, outputs): (Vec<_>, Vec<_>) = sources
            .iter()
            .map(|(name, text)| {
                let (source, output) = Source::in_memory(*name, *text);
                (Arc::new(source), output)
            })
            .unzip();
        (
            LinkJob {
                sources,
                ..Default::default()
            },
            outputs,
        )
    }

    #[test]
    fn links_all_sources() {
        let (job, outputs) = job(&[
            (
                "A.j",
                ";@class|name=A|flags=public\n;@method|sig=f()V|flags=public static\n",
            ),
            (
                "B.j",
                ";@class|name=B|flags=public\n;@invoke-begin\n;@invoke-end|sig=f()V\n",
            ),
        ]);
        linker(InMemoryLoader::new()).link(&job).unwrap();
        let b = outputs[1].text().unwrap();
        assert!(b.contains("invokestatic A/f()V"), "{b}");
        assert!(outputs[0].text().unwrap().starts_with(".class public A"));
    }

    #[test]
    fn failed_sources_produce_no_output() {
        let (job, outputs) = job(&[
            ("A.j", ";@class|name=A\n"),
            ("B.j", ";@class|name=B\n;@invoke-begin\n;@invoke-end|sig=g()V\n"),
            ("C.j", ";@class|name=C\n;@read-field|sig=missing I\n"),
        ]);
        let error = linker(InMemoryLoader::new()).link(&job).unwrap_err();
        assert!(matches!(
            LinkError::of(&error),
            Some(LinkError::Resolution(_))
        ));
        assert!(outputs[0].text().is_some());
        assert!(outputs[1].text().is_none());
        assert!(outputs[2].text().is_none());
    }

    #[test]
    fn missing_library() {
        let (mut job, outputs) = job(&[("A.j", ";@class|name=A\n")]);
        job.libraries.push(ClassName::new("lib/Missing"));
        let error = linker(InMemoryLoader::new()).link(&job).unwrap_err();
        assert_eq!(error.to_string(), "library class `lib/Missing` was not found");
        assert!(outputs[0].text().is_none());
        // Everything was cleaned up, so the source is closed.
        assert!(job.sources[0].start_input().is_err());
    }

    #[test]
    fn duplicate_classes() {
        let (job, _outputs) = job(&[("A.j", ";@class|name=p/A\n"), ("B.j", ";@class|name=p.A\n")]);
        let error = linker(InMemoryLoader::new()).link(&job).unwrap_err();
        assert_eq!(
            error.to_string(),
            "class `p/A` is declared by both `A.j` and `B.j`"
        );
    }

    /// Panics when asked for any class.
    struct PanickingLoader;

    impl MetadataLoader for PanickingLoader {
        fn lookup(
            &self,
            name: &ClassName,
        ) -> std::result::Result<Arc<ClassDescriptor>, LookupError> {
            panic!("cannot look up `{name}`");
        }
    }

    #[test]
    fn panicking_tasks_fail_the_link() {
        let (job, outputs) = job(&[
            ("A.j", ";@class|name=A\n"),
            ("B.j", ";@class|name=B\n;@invoke-begin\n;@invoke-end|sig=lib/X/f()V\n"),
        ]);
        let linker = Linker::new(
            Arc::new(PanickingLoader),
            LinkerConfig {
                num_threads: NonZeroUsize::new(2).unwrap(),
                ..Default::default()
            },
        );
        let error = linker.link(&job).unwrap_err();
        assert!(matches!(
            LinkError::of(&error),
            Some(LinkError::WorkerFault(_))
        ));
        assert!(outputs[0].text().is_some());
        assert!(outputs[1].text().is_none());
        // The source whose task panicked was still closed.
        assert!(job.sources[1].start_input().is_err());
    }

    #[test]
    fn first_error_is_returned() {
        let errors = vec![anyhow::anyhow!("one"), anyhow::anyhow!("two")];
        assert_eq!(first_error(errors).to_string(), "one");
        assert!(matches!(
            LinkError::of(&first_error(Vec::new())),
            Some(LinkError::WorkerFault(_))
        ));
    }
}
