//! The directive set that swaps the application entry point for the loader
//! and records what it replaced.

use log::info;

use super::resources::StringTable;
use super::xml::{Document, Element};
use crate::error::{Error, Result};
use crate::settings::DEFAULT_PROVIDER_CLASS;

pub const SHELL_APPLICATION: &str = "com.kapp.shell.ShellApplication";
pub const SHELL_COMPONENT_FACTORY: &str = "com.kapp.shell.ShellComponentFactory";
pub const ORIGINAL_APPLICATION_KEY: &str = "kapp.original_application";
pub const ORIGINAL_FACTORY_KEY: &str = "kapp.original_factory";
pub const AUTHORITY_SUFFIX: &str = "kapp-bootstrap";
pub const PROVIDER_INIT_ORDER: &str = "1000";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PatchDirectives {
    pub provider_class: String,
}

impl Default for PatchDirectives {
    fn default() -> Self {
        PatchDirectives {
            provider_class: DEFAULT_PROVIDER_CLASS.to_string(),
        }
    }
}

/// What the loader needs to hand control back to the real application.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PatchOutcome {
    pub package: String,
    /// Empty when the target declares no application class.
    pub original_application: String,
    pub original_factory: Option<String>,
}

/// Applies the directive set to `document`. Applying it to its own output
/// yields the same document and outcome.
pub fn apply(
    document: &mut Document,
    directives: &PatchDirectives,
    strings: Option<&StringTable>,
) -> Result<PatchOutcome> {
    let package = document
        .root
        .attr("package")
        .map(str::trim)
        .unwrap_or_default()
        .to_string();
    if document.root.child("application").is_none() {
        return Err(Error::ManifestInvalid(
            "no <application> element found in AndroidManifest.xml".to_string(),
        ));
    }
    if package.is_empty() {
        return Err(Error::ManifestInvalid(
            "target manifest missing package attribute".to_string(),
        ));
    }

    document.declare_android_namespace();
    let ns = AndroidAttrs::new(&document.android_prefix());
    let application = document
        .root
        .child_mut("application")
        .ok_or_else(|| Error::ManifestInvalid("no <application> element".to_string()))?;

    let original_factory = match application.attr(&ns.app_component_factory) {
        Some(SHELL_COMPONENT_FACTORY) => meta_value(application, &ns, ORIGINAL_FACTORY_KEY),
        Some(factory) if !factory.is_empty() => Some(qualify(&package, factory)),
        _ => None,
    };
    if let Some(factory) = &original_factory {
        info!("Original appComponentFactory: '{factory}'");
        application.set_attr(&ns.app_component_factory, SHELL_COMPONENT_FACTORY);
    }

    let original_application = match application.attr(&ns.name) {
        Some(SHELL_APPLICATION) => {
            meta_value(application, &ns, ORIGINAL_APPLICATION_KEY).unwrap_or_default()
        }
        Some(name) if !name.is_empty() => qualify(&package, name),
        _ => String::new(),
    };
    info!("Original application: '{original_application}'");
    application.set_attr(&ns.name, SHELL_APPLICATION);

    if application.remove_attr(&ns.debuggable).is_some() {
        info!("Stripping android:debuggable attribute...");
    }

    upsert_meta(application, &ns, ORIGINAL_APPLICATION_KEY, &original_application);
    if let Some(factory) = &original_factory {
        upsert_meta(application, &ns, ORIGINAL_FACTORY_KEY, factory);
    }

    upsert_provider(
        application,
        &ns,
        &directives.provider_class,
        &format!("{package}.{AUTHORITY_SUFFIX}"),
    );

    if let Some(strings) = strings.filter(|table| !table.is_empty()) {
        inline_string_values(application, &ns, strings);
    }

    Ok(PatchOutcome {
        package,
        original_application,
        original_factory,
    })
}

/// Qualified attribute keys for the document's Android prefix.
struct AndroidAttrs {
    name: String,
    value: String,
    authorities: String,
    exported: String,
    init_order: String,
    debuggable: String,
    app_component_factory: String,
}

impl AndroidAttrs {
    fn new(prefix: &str) -> Self {
        let key = |local: &str| format!("{prefix}:{local}");
        AndroidAttrs {
            name: key("name"),
            value: key("value"),
            authorities: key("authorities"),
            exported: key("exported"),
            init_order: key("initOrder"),
            debuggable: key("debuggable"),
            app_component_factory: key("appComponentFactory"),
        }
    }
}

/// Expands the manifest shorthand `.App` / `App` to a fully qualified name.
fn qualify(package: &str, class: &str) -> String {
    if class.starts_with('.') {
        format!("{package}{class}")
    } else if !class.contains('.') {
        format!("{package}.{class}")
    } else {
        class.to_string()
    }
}

fn meta_value(application: &Element, ns: &AndroidAttrs, key: &str) -> Option<String> {
    application
        .elements()
        .filter(|child| child.name == "meta-data")
        .find(|child| child.attr(&ns.name) == Some(key))
        .and_then(|child| child.attr(&ns.value))
        .map(str::to_string)
}

fn upsert_meta(application: &mut Element, ns: &AndroidAttrs, key: &str, value: &str) {
    let existing = application
        .elements_mut()
        .find(|child| child.name == "meta-data" && child.attr(&ns.name) == Some(key));
    let meta = match existing {
        Some(meta) => meta,
        None => application.push_element(Element::new("meta-data")),
    };
    meta.set_attr(&ns.name, key);
    meta.set_attr(&ns.value, value);
}

fn upsert_provider(application: &mut Element, ns: &AndroidAttrs, class: &str, authorities: &str) {
    let existing = application
        .elements_mut()
        .find(|child| child.name == "provider" && child.attr(&ns.name) == Some(class));
    let provider = match existing {
        Some(provider) => provider,
        None => {
            let mut provider = Element::new("provider");
            provider.set_attr(&ns.name, class);
            application.push_element(provider)
        }
    };
    provider.set_attr(&ns.authorities, authorities);
    provider.set_attr(&ns.exported, "false");
    provider.set_attr(&ns.init_order, PROVIDER_INIT_ORDER);
}

fn inline_string_values(application: &mut Element, ns: &AndroidAttrs, strings: &StringTable) {
    application.visit_mut(&mut |element: &mut Element| {
        let resolved = element
            .attr(&ns.value)
            .and_then(|value| value.strip_prefix("@string/"))
            .and_then(|name| strings.get(name))
            .filter(|text| !text.is_empty())
            .cloned();
        if let Some(text) = resolved {
            element.set_attr(&ns.value, text);
        }
    });
}
