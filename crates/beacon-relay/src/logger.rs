// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Relay log lines.
//!
//! ```text
//! BEACON | LEVEL | [foreign::target] span{fields}: message fields
//! ```
//!
//! Events from the relay and the pipeline carry no target. Anything else, such
//! as the HTTP stack, is tagged with where it came from:
//!
//! ```text
//! BEACON | INFO | Relaying stdin into pipeline for 2333333-42
//! BEACON | DEBUG | [reqwest::connect] starting new connection
//! ```

use std::fmt;

use tracing_core::{Event, Subscriber};
use tracing_subscriber::fmt::{
    format::{self, FormatEvent, FormatFields},
    FmtContext, FormattedFields,
};
use tracing_subscriber::registry::LookupSpan;

const OWN_TARGETS: [&str; 2] = ["beacon", "beacon_relay"];

#[derive(Debug, Clone, Copy)]
pub struct Formatter {
    prefix: &'static str,
}

impl Default for Formatter {
    fn default() -> Self {
        Formatter { prefix: "BEACON" }
    }
}

fn is_own_target(target: &str) -> bool {
    OWN_TARGETS.iter().any(|own| {
        target
            .strip_prefix(own)
            .is_some_and(|rest| rest.is_empty() || rest.starts_with("::"))
    })
}

/// Active spans, outermost first, each followed by `: `.
fn write_scope<S, N>(ctx: &FmtContext<'_, S, N>, writer: &mut format::Writer<'_>) -> fmt::Result
where
    S: Subscriber + for<'a> LookupSpan<'a>,
    N: for<'a> FormatFields<'a> + 'static,
{
    let Some(scope) = ctx.event_scope() else {
        return Ok(());
    };
    for span in scope.from_root() {
        let extensions = span.extensions();
        match extensions
            .get::<FormattedFields<N>>()
            .filter(|fields| !fields.is_empty())
        {
            Some(fields) => write!(writer, "{}{{{}}}: ", span.name(), fields)?,
            None => write!(writer, "{}: ", span.name())?,
        }
    }
    Ok(())
}

impl<S, N> FormatEvent<S, N> for Formatter
where
    S: Subscriber + for<'a> LookupSpan<'a>,
    N: for<'a> FormatFields<'a> + 'static,
{
    fn format_event(
        &self,
        ctx: &FmtContext<'_, S, N>,
        mut writer: format::Writer<'_>,
        event: &Event<'_>,
    ) -> fmt::Result {
        let metadata = event.metadata();
        write!(writer, "{} | {} | ", self.prefix, metadata.level())?;
        if !is_own_target(metadata.target()) {
            write!(writer, "[{}] ", metadata.target())?;
        }
        write_scope(ctx, &mut writer)?;
        ctx.field_format().format_fields(writer.by_ref(), event)?;
        writeln!(writer)
    }
}
