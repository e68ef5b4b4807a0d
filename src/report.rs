//! SARIF rendering of an analysis.

use serde_json::json;
use serde_sarif::sarif::{
    Artifact, ArtifactLocation, Invocation, Location, LogicalLocation, Message as SarifMessage,
    Result as SarifResult, ResultLevel, Run, Sarif, Tool, ToolComponent, SCHEMA_URL,
};

use crate::analysis::context::AnalysisContext;
use crate::messages::{Message, Severity};

const TOOL_NAME: &str = "djvm";

pub fn build_invocation(successful: bool) -> Invocation {
    let arguments: Vec<String> = std::env::args().collect();
    let command_line = arguments.join(" ");

    Invocation::builder()
        .execution_successful(successful)
        .arguments(arguments)
        .command_line(command_line)
        .build()
}

/// One run listing every discovered class as an artifact and every
/// recorded message as a result, in message order.
pub fn build_sarif(context: &AnalysisContext, invocation: Invocation) -> Sarif {
    let driver = ToolComponent::builder()
        .name(TOOL_NAME)
        .version(env!("CARGO_PKG_VERSION"))
        .build();
    let tool = Tool {
        driver,
        extensions: None,
        properties: None,
    };
    let results: Vec<SarifResult> = context.messages.sorted().map(sarif_result).collect();
    let artifacts: Vec<Artifact> = context
        .classes()
        .iter()
        .map(|class| {
            Artifact::builder()
                .location(ArtifactLocation::builder().uri(class.byte_code.source.uri()).build())
                .length(class.byte_code.bytes.len() as i64)
                .build()
        })
        .collect();
    let run = if artifacts.is_empty() {
        Run::builder()
            .tool(tool)
            .invocations(vec![invocation])
            .results(results)
            .build()
    } else {
        Run::builder()
            .tool(tool)
            .invocations(vec![invocation])
            .results(results)
            .artifacts(artifacts)
            .build()
    };

    Sarif::builder()
        .schema(SCHEMA_URL)
        .runs(vec![run])
        .version(json!("2.1.0"))
        .build()
}

fn sarif_result(message: &Message) -> SarifResult {
    SarifResult::builder()
        .rule_id(message.source.clone())
        .level(level(message.severity))
        .message(SarifMessage::builder().text(message.message.clone()).build())
        .locations(vec![location(message)])
        .build()
}

fn level(severity: Severity) -> ResultLevel {
    match severity {
        Severity::Error => ResultLevel::Error,
        Severity::Warning => ResultLevel::Warning,
        Severity::Informational | Severity::Trace => ResultLevel::Note,
    }
}

fn location(message: &Message) -> Location {
    let location = &message.location;
    let class_name = location.class_name.replace('/', ".");
    let logical = match (&location.member_name, &location.descriptor) {
        (Some(member_name), Some(descriptor)) => LogicalLocation::builder()
            .name(format!("{class_name}.{member_name}{descriptor}"))
            .kind("function")
            .build(),
        (Some(member_name), None) => LogicalLocation::builder()
            .name(format!("{class_name}.{member_name}"))
            .kind("member")
            .build(),
        _ => LogicalLocation::builder().name(class_name).kind("type").build(),
    };
    Location::builder().logical_locations(vec![logical]).build()
}
