use object::HeapSettings;

/// Interpreter options, parsed from a comma-separated string such as
/// `"jit=System.Math,-inline,trace=Fib"`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InterpOptions {
    /// Class-name prefixes whose methods run their compiled code.
    pub jit_classes: Vec<String>,
    /// Class-name prefixes that are always interpreted; wins over
    /// `jit_classes`.
    pub interp_only_classes: Vec<String>,
    /// Forwarded to the transformer.
    pub inline: bool,
    /// Forwarded to the transformer.
    pub cprop: bool,
    pub trace: bool,
    /// Trace only methods whose name contains this string.
    pub trace_filter: Option<String>,
    pub count_ops: bool,
}

impl Default for InterpOptions {
    fn default() -> Self {
        Self {
            jit_classes: Vec::new(),
            interp_only_classes: Vec::new(),
            inline: true,
            cprop: true,
            trace: false,
            trace_filter: None,
            count_ops: false,
        }
    }
}

impl InterpOptions {
    /// Parse an option string. Unknown options are logged and ignored.
    pub fn parse(options: &str) -> Self {
        let mut parsed = Self::default();
        for option in options.split(',').map(str::trim).filter(|o| !o.is_empty()) {
            if let Some(prefix) = option.strip_prefix("jit=") {
                parsed.jit_classes.push(prefix.to_owned());
            } else if let Some(prefix) = option.strip_prefix("interp-only=") {
                parsed.interp_only_classes.push(prefix.to_owned());
            } else if let Some(filter) = option.strip_prefix("trace=") {
                parsed.trace = true;
                parsed.trace_filter = Some(filter.to_owned());
            } else {
                match option {
                    "-inline" => parsed.inline = false,
                    "-cprop" => parsed.cprop = false,
                    "trace" => parsed.trace = true,
                    "count-ops" => parsed.count_ops = true,
                    other => log::warn!("ignoring unknown interpreter option `{other}`"),
                }
            }
        }
        parsed
    }

    /// Whether methods of `class_name` should run their compiled code when
    /// they have some.
    pub fn prefers_compiled(&self, class_name: &str) -> bool {
        if self
            .interp_only_classes
            .iter()
            .any(|prefix| class_name.starts_with(prefix.as_str()))
        {
            return false;
        }
        self.jit_classes
            .iter()
            .any(|prefix| class_name.starts_with(prefix.as_str()))
    }

    /// Whether calls to `method_name` are traced.
    pub fn traces(&self, method_name: &str) -> bool {
        self.trace
            && self
                .trace_filter
                .as_deref()
                .is_none_or(|filter| method_name.contains(filter))
    }
}

/// Settings for [`Domain::new`](crate::Domain::new).
#[derive(Debug, Clone)]
pub struct DomainCreateInfo {
    pub heap: HeapSettings,
    /// Minimum size, in cells, of each chunk of the per-thread frame arena.
    pub arena_chunk_cells: usize,
    pub options: InterpOptions,
}

impl Default for DomainCreateInfo {
    fn default() -> Self {
        Self {
            heap: HeapSettings::default(),
            arena_chunk_cells: 64 * 1024,
            options: InterpOptions::default(),
        }
    }
}
