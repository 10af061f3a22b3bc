//! Code for reporting how long each phase of linking takes when the --time argument is supplied.
//!
//! Most phases run once per source, on whichever worker picks the task up, so rather than printing
//! each span as it closes, we add up the time spent in each phase and print a summary when the
//! outermost span closes.

use crate::error::AlreadyInitialised;
use indexmap::IndexMap;
use std::fmt::Display;
use std::sync::Mutex;
use std::time::Duration;
use std::time::Instant;

#[derive(Default)]
struct TimingLayer {
    phases: Mutex<IndexMap<&'static str, PhaseTotal>>,
}

struct Data {
    start: Instant,
}

#[derive(Default)]
struct PhaseTotal {
    depth: usize,
    count: u32,
    total: Duration,
}

impl<S> tracing_subscriber::Layer<S> for TimingLayer
where
    S: tracing::Subscriber + for<'span> tracing_subscriber::registry::LookupSpan<'span>,
{
    fn max_level_hint(&self) -> Option<tracing::level_filters::LevelFilter> {
        Some(tracing::level_filters::LevelFilter::INFO)
    }

    fn on_new_span(
        &self,
        attributes: &tracing::span::Attributes,
        id: &tracing::span::Id,
        ctx: tracing_subscriber::layer::Context<S>,
    ) {
        if *attributes.metadata().level() > tracing::Level::INFO {
            return;
        }
        let span = ctx.span(id).expect("valid span ID");
        span.extensions_mut().insert(Data {
            start: Instant::now(),
        });
    }

    fn on_close(&self, id: tracing::span::Id, ctx: tracing_subscriber::layer::Context<S>) {
        let span = ctx.span(&id).expect("valid span ID");
        let Some(elapsed) = span
            .extensions()
            .get::<Data>()
            .map(|data| data.start.elapsed())
        else {
            return;
        };
        let depth = span.scope().count() - 1;

        let mut phases = self.phases.lock().unwrap();
        let phase = phases.entry(span.metadata().name()).or_insert(PhaseTotal {
            depth,
            ..Default::default()
        });
        phase.depth = phase.depth.min(depth);
        phase.count += 1;
        phase.total += elapsed;

        if depth == 0 {
            for (name, phase) in phases.drain(..) {
                println!("{}", PhaseLine { name, phase: &phase });
            }
        }
    }
}

pub(crate) fn init_tracing() -> Result<(), AlreadyInitialised> {
    use tracing_subscriber::prelude::*;
    let layer = TimingLayer::default();
    let subscriber = tracing_subscriber::Registry::default().with(layer);
    tracing::subscriber::set_global_default(subscriber).map_err(|_| AlreadyInitialised)
}

struct PhaseLine<'a> {
    name: &'static str,
    phase: &'a PhaseTotal,
}

impl Display for PhaseLine<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let ms = self.phase.total.as_secs_f64() * 1000.0;
        for _ in 0..self.phase.depth {
            write!(f, "│ ")?;
        }
        write!(f, "{ms:>8.2} {}", self.name)?;
        if self.phase.count > 1 {
            write!(f, " (x{})", self.phase.count)?;
        }
        Ok(())
    }
}
