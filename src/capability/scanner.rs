//! Discovery of classes in a plugin module.

use tracing::debug;

use super::{ClassRef, ExportValue, Marker, PluginModule, DEFAULT_EXPORT};
use crate::endpoint::EndpointError;
use crate::error::{CapabilityError, ErrorCode};

#[derive(Debug, thiserror::Error)]
pub enum ScanError {
    #[error("plugin module is missing")]
    MissingModule,
    #[error("no {marker} class found{}", class_hint(.class_name))]
    NotFound {
        marker: Marker,
        class_name: Option<String>,
    },
    #[error("class {class} does not implement {marker}")]
    InvalidClass { class: String, marker: Marker },
    #[error("failed to construct {class}: {source}")]
    Construct {
        class: String,
        #[source]
        source: CapabilityError,
    },
    #[error(transparent)]
    Endpoint(#[from] EndpointError),
}

fn class_hint(name: &Option<String>) -> String {
    match name {
        Some(n) => format!(" (looked for '{}' and the default export)", n),
        None => " in the default export".to_string(),
    }
}

impl ScanError {
    pub fn code(&self) -> ErrorCode {
        match self {
            Self::NotFound { .. } => ErrorCode::CapabilityNotFound,
            _ => ErrorCode::InvalidRequest,
        }
    }
}

/// A class found among a module's exports.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClassInfo {
    pub name: String,
    pub export_name: String,
    pub class: ClassRef,
    pub is_default: bool,
}

/// List every class export, including `default`. Functions and plain values
/// are skipped.
pub fn scan_classes(module: Option<&PluginModule>) -> Result<Vec<ClassInfo>, ScanError> {
    let module = module.ok_or(ScanError::MissingModule)?;
    let classes: Vec<ClassInfo> = module
        .exports()
        .filter_map(|(export_name, value)| match value {
            ExportValue::Class(class) => {
                let is_default = export_name == DEFAULT_EXPORT;
                Some(ClassInfo {
                    name: if is_default {
                        class.name().to_string()
                    } else {
                        export_name.to_string()
                    },
                    export_name: export_name.to_string(),
                    class: class.clone(),
                    is_default,
                })
            }
            ExportValue::Function(_) | ExportValue::Value(_) => None,
        })
        .collect();
    debug!(exports = module.len(), classes = classes.len(), "module scanned");
    Ok(classes)
}

/// Classes carrying `marker`. The marker list is the only criterion, so an
/// abstract base is included exactly when it carries the marker itself.
pub fn find_sub_classes(
    module: Option<&PluginModule>,
    marker: Marker,
) -> Result<Vec<ClassInfo>, ScanError> {
    Ok(scan_classes(module)?
        .into_iter()
        .filter(|info| info.class.has_marker(marker))
        .collect())
}

/// Find a class by its name, or by its export name when `by_export_name`.
pub fn find_class(
    module: Option<&PluginModule>,
    name: &str,
    by_export_name: bool,
) -> Result<Option<ClassInfo>, ScanError> {
    Ok(scan_classes(module)?.into_iter().find(|info| {
        if by_export_name {
            info.export_name == name
        } else {
            info.name == name
        }
    }))
}

/// Pick the one class implementing `marker`: the class named `class_name`
/// when given and present, otherwise the default export.
pub fn load_single_subclass(
    module: Option<&PluginModule>,
    marker: Marker,
    class_name: Option<&str>,
) -> Result<ClassInfo, ScanError> {
    let candidates = find_sub_classes(module, marker)?;
    let class_name = class_name.filter(|n| !n.is_empty());

    if let Some(name) = class_name {
        if let Some(found) = candidates.iter().find(|info| info.name == name) {
            return Ok(found.clone());
        }
    }
    candidates
        .into_iter()
        .find(|info| info.is_default)
        .ok_or_else(|| ScanError::NotFound {
            marker,
            class_name: class_name.map(str::to_string),
        })
}

#[cfg(test)]
mod tests {
    use super::super::fixtures::*;
    use super::*;

    #[test]
    fn test_scan_skips_non_classes() {
        let module = demo_module();
        let classes = scan_classes(Some(&module)).unwrap();
        assert_eq!(classes.len(), 7);
        assert!(classes.iter().all(|c| c.export_name != "helper"));
        assert!(classes.iter().all(|c| c.export_name != "VERSION"));
    }

    #[test]
    fn test_default_export_uses_class_name() {
        let module = demo_module();
        let classes = scan_classes(Some(&module)).unwrap();
        let default = classes.iter().find(|c| c.is_default).unwrap();
        assert_eq!(default.name, "DemoProvider");
        assert_eq!(default.export_name, "default");
    }

    #[test]
    fn test_missing_module_rejected() {
        assert!(matches!(scan_classes(None), Err(ScanError::MissingModule)));
        assert!(matches!(
            find_sub_classes(None, Marker::Tool),
            Err(ScanError::MissingModule)
        ));
    }

    #[test]
    fn test_empty_module_is_fine() {
        let module = PluginModule::new();
        assert!(scan_classes(Some(&module)).unwrap().is_empty());
    }

    #[test]
    fn test_find_sub_classes_by_marker() {
        let module = demo_module();
        let tools = find_sub_classes(Some(&module), Marker::Tool).unwrap();
        assert_eq!(tools.len(), 1);
        assert_eq!(tools[0].name, "EchoTool");

        // DemoProvider carries two markers.
        assert_eq!(
            find_sub_classes(Some(&module), Marker::ToolProvider).unwrap().len(),
            1
        );
        assert_eq!(
            find_sub_classes(Some(&module), Marker::OAuthProvider).unwrap().len(),
            1
        );
        assert!(find_sub_classes(Some(&module), Marker::DynamicSelect)
            .unwrap()
            .is_empty());
    }

    #[test]
    fn test_abstract_base_without_marker_excluded() {
        let module = demo_module();
        let tools = find_sub_classes(Some(&module), Marker::Tool).unwrap();
        assert!(tools.iter().all(|c| c.name != "BaseTool"));
    }

    #[test]
    fn test_same_class_under_two_names() {
        let module = PluginModule::new()
            .class::<EchoTool>("EchoTool")
            .class::<EchoTool>("Echo")
            .default_class::<EchoTool>();
        let tools = find_sub_classes(Some(&module), Marker::Tool).unwrap();
        assert_eq!(tools.len(), 3);
        assert_eq!(tools[0].class, tools[1].class);
        assert_eq!(tools[1].class, tools[2].class);
        assert_eq!(tools[2].name, "EchoTool");
    }

    #[test]
    fn test_find_class() {
        let module = PluginModule::new().class::<EchoTool>("Echo");
        assert!(find_class(Some(&module), "Echo", false).unwrap().is_some());
        assert!(find_class(Some(&module), "Echo", true).unwrap().is_some());
        assert!(find_class(Some(&module), "EchoTool", false).unwrap().is_none());

        let module = PluginModule::new().default_class::<EchoTool>();
        assert!(find_class(Some(&module), "EchoTool", false).unwrap().is_some());
        assert!(find_class(Some(&module), "default", true).unwrap().is_some());
    }

    #[test]
    fn test_load_single_subclass_prefers_named() {
        let module = PluginModule::new()
            .class::<EchoTool>("Echo")
            .default_class::<EchoTool>();
        let info = load_single_subclass(Some(&module), Marker::Tool, Some("Echo")).unwrap();
        assert!(!info.is_default);

        let info = load_single_subclass(Some(&module), Marker::Tool, Some("Nope")).unwrap();
        assert!(info.is_default);

        let info = load_single_subclass(Some(&module), Marker::Tool, None).unwrap();
        assert!(info.is_default);
    }

    #[test]
    fn test_load_single_subclass_not_found() {
        let module = PluginModule::new().class::<EchoTool>("Echo");
        let err = load_single_subclass(Some(&module), Marker::Tool, None).unwrap_err();
        assert!(matches!(err, ScanError::NotFound { .. }));
        assert_eq!(err.code(), ErrorCode::CapabilityNotFound);

        let err = load_single_subclass(Some(&module), Marker::Model, Some("Echo")).unwrap_err();
        assert!(err.to_string().contains("Echo"));
    }
}
