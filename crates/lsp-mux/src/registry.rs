//! Static per-server behavior registry.
//!
//! A [`ServerSpec`] describes everything the daemon needs to know about one
//! kind of language server: how to find the binary, how to invoke it in
//! stdio LSP mode, how diagnostics flow, and the hooks applied to messages
//! on their way through the mux. Specs are immutable; lookup is by canonical
//! name or alias.

use core::fmt;
use core::time::Duration;

use lsp_proto::Request;
use serde_json::{Map, Value};

#[derive(Debug)]
pub struct ServerSpec {
    pub name: &'static str,
    pub aliases: &'static [&'static str],
    pub binary: BinarySpec,
    /// Arguments appended when invoking the server in stdio LSP mode.
    pub args: &'static [&'static str],
    pub diagnostics: DiagnosticsMode,
    /// Pure transform applied to the first `initialize` request before it is
    /// forwarded to the server.
    pub prepare_initialize: Option<fn(&mut Request)>,
}

impl ServerSpec {
    pub fn matches(&self, name: &str) -> bool {
        self.name == name || self.aliases.contains(&name)
    }
}

/// How the server binary is located, in probe order.
#[derive(Debug)]
pub struct BinarySpec {
    /// Environment variable overriding the executable path.
    pub env_var: &'static str,
    /// Executable names probed in the project tree and on `PATH`.
    pub candidates: &'static [&'static str],
    /// Directory probed relative to the project root and its ancestors.
    pub local_probe: Option<&'static str>,
    /// On-demand install fallback when nothing else matched.
    pub install: Option<InstallSpec>,
}

#[derive(Debug)]
pub struct InstallSpec {
    pub package: &'static str,
    pub bin: &'static str,
}

#[derive(Clone, Copy, Debug)]
pub enum DiagnosticsMode {
    /// Server pushes `textDocument/publishDiagnostics` on its own.
    Passthrough,
    /// Server only supports pull diagnostics; the mux emulates push for
    /// clients that lack the capability.
    PullToPush {
        debounce: Duration,
        /// Overrides the default `textDocument/diagnostic` params builder.
        build_request: Option<fn(&str) -> Value>,
    },
}

#[derive(Debug)]
pub struct UnknownServer {
    pub name: String,
}

impl std::error::Error for UnknownServer {}

impl fmt::Display for UnknownServer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "unknown server: `{}`", self.name)
    }
}

static SPECS: &[ServerSpec] = &[
    ServerSpec {
        name: "tsgo",
        aliases: &["typescript-go"],
        binary: BinarySpec {
            env_var: "TSGO_PATH",
            candidates: &["tsgo"],
            local_probe: Some("node_modules/.bin"),
            install: Some(InstallSpec {
                package: "@typescript/native-preview",
                bin: "tsgo",
            }),
        },
        args: &["--lsp", "--stdio"],
        diagnostics: DiagnosticsMode::PullToPush {
            debounce: Duration::from_millis(150),
            build_request: None,
        },
        prepare_initialize: Some(advertise_pull_diagnostics),
    },
    ServerSpec {
        name: "oxlint",
        aliases: &[],
        binary: BinarySpec {
            env_var: "OXLINT_PATH",
            candidates: &["oxc_language_server"],
            local_probe: Some("node_modules/.bin"),
            install: Some(InstallSpec {
                package: "oxlint",
                bin: "oxc_language_server",
            }),
        },
        args: &[],
        diagnostics: DiagnosticsMode::Passthrough,
        prepare_initialize: None,
    },
];

/// Looks a spec up by canonical name or alias.
pub fn find(name: &str) -> Result<&'static ServerSpec, UnknownServer> {
    SPECS.iter().find(|spec| spec.matches(name)).ok_or_else(|| UnknownServer {
        name: name.to_owned(),
    })
}

/// All distinct registered specs, for help output.
pub fn all() -> impl Iterator<Item = &'static ServerSpec> {
    SPECS.iter()
}

/// Merges `capabilities.textDocument.diagnostic` into the initialize params
/// unless the client already requested pull diagnostics itself. The server
/// refuses to answer `textDocument/diagnostic` otherwise, which would starve
/// the bridge.
fn advertise_pull_diagnostics(request: &mut Request) {
    let params = request.params_mut();
    let capabilities = ensure_object(params, "capabilities");
    let text_document = ensure_object(capabilities, "textDocument");

    let Value::Object(text_document) = text_document else {
        return;
    };
    text_document
        .entry("diagnostic")
        .or_insert_with(|| Value::Object(Map::new()));
}

fn ensure_object<'a>(value: &'a mut Value, key: &str) -> &'a mut Value {
    if !value.is_object() {
        *value = Value::Object(Map::new());
    }
    match value {
        Value::Object(map) => map
            .entry(key.to_owned())
            .or_insert_with(|| Value::Object(Map::new())),
        _ => unreachable!("value was just made an object"),
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used, reason = "test code can panic on errors")]

    use super::*;
    use lsp_proto::MessageId;
    use serde_json::json;

    #[test]
    fn find_by_name_and_alias() {
        assert_eq!(find("tsgo").unwrap().name, "tsgo");
        assert_eq!(find("typescript-go").unwrap().name, "tsgo");
        assert_eq!(find("oxlint").unwrap().name, "oxlint");
    }

    #[test]
    fn unknown_server_is_an_error() {
        let error = find("rust-analyzer").unwrap_err();
        assert_eq!(error.name, "rust-analyzer");
    }

    #[test]
    fn all_lists_distinct_specs() {
        let names: Vec<_> = all().map(|spec| spec.name).collect();
        assert_eq!(names, vec!["tsgo", "oxlint"]);
    }

    #[test]
    fn tsgo_hook_injects_diagnostic_capability() {
        let hook = find("tsgo").unwrap().prepare_initialize.unwrap();

        let mut request = Request::new(
            MessageId::Int(1),
            "initialize",
            Some(json!({"capabilities": {"textDocument": {"hover": {}}}})),
        );
        hook(&mut request);

        let params = request.params().unwrap();
        assert!(params.pointer("/capabilities/textDocument/diagnostic").is_some());
        assert!(params.pointer("/capabilities/textDocument/hover").is_some());
    }

    #[test]
    fn tsgo_hook_keeps_client_provided_capability() {
        let hook = find("tsgo").unwrap().prepare_initialize.unwrap();

        let mut request = Request::new(
            MessageId::Int(1),
            "initialize",
            Some(json!({"capabilities": {"textDocument": {"diagnostic": {"dynamicRegistration": true}}}})),
        );
        hook(&mut request);

        let diagnostic = request
            .params()
            .unwrap()
            .pointer("/capabilities/textDocument/diagnostic")
            .unwrap();
        assert_eq!(diagnostic, &json!({"dynamicRegistration": true}));
    }

    #[test]
    fn tsgo_hook_handles_missing_params() {
        let hook = find("tsgo").unwrap().prepare_initialize.unwrap();

        let mut request = Request::new(MessageId::Int(1), "initialize", None);
        hook(&mut request);

        assert!(
            request
                .params()
                .unwrap()
                .pointer("/capabilities/textDocument/diagnostic")
                .is_some()
        );
    }
}
