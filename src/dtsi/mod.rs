//! DTSI code generation: `(profile, layout) -> (.keymap, .conf)`.
//!
//! Output is deterministic for identical inputs: includes are ordered (base
//! first, then sorted behavior includes), layers follow `layer_names`,
//! Kconfig options are sorted. UTF-8, `\n` endings, no trailing whitespace,
//! final newline.

mod format;
mod kconfig;
mod keymap;

use crate::behavior::BehaviorRegistry;
use crate::error::{Error, Result};
use crate::layout::{Binding, LayoutData};
use crate::profile::KeyboardProfile;
use std::collections::BTreeSet;
use tracing::debug;

/// The generator's output pair plus non-fatal findings.
#[derive(Debug, Clone)]
pub struct GeneratedSources {
    /// The `.keymap` DTSI source.
    pub keymap: String,
    /// The `.conf` Kconfig source (may be empty).
    pub conf: String,
    /// Non-fatal warnings (unused variables, many layers, ...).
    pub warnings: Vec<String>,
}

/// Generates keymap and conf sources for a layout against a profile.
pub fn generate(profile: &KeyboardProfile, layout: &LayoutData) -> Result<GeneratedSources> {
    layout.check_invariants()?;

    let resolved = resolve_layout(profile, layout)?;
    validate(profile, &resolved)?;

    let registry = BehaviorRegistry::for_profile(profile)?.with_layout(&resolved)?;
    validate_bindings(&registry, &resolved)?;

    let used = resolved.behavior_codes_used();
    let includes = registry.required_includes(&used);
    debug!(keyboard = %profile.keyboard_name, includes = includes.len(), "resolved includes");

    let keymap = keymap::emit_keymap(profile, &resolved, &includes)?;
    let conf = kconfig::generate_conf(profile, &resolved);
    let warnings = collect_warnings(profile, layout, &resolved);

    Ok(GeneratedSources {
        keymap,
        conf,
        warnings,
    })
}

/// Renders layers as an aligned textual grid for `layout show`.
pub fn render_layers(profile: &KeyboardProfile, layout: &LayoutData) -> Result<String> {
    layout.check_invariants()?;
    let resolved = resolve_layout(profile, layout)?;
    let formatting = profile.keymap().formatting;

    let mut out = String::new();
    for (index, name) in resolved.layer_names.iter().enumerate() {
        out.push_str(&format!("Layer {index}: {name}\n"));
        let cells: Vec<String> = resolved.layers[index].iter().map(|b| b.to_dtsi()).collect();
        out.push_str(&format::format_grid(&cells, &formatting)?);
        out.push_str("\n\n");
    }
    Ok(out)
}

/// Produces the resolved copy the emitter works on: `${var}` references
/// substituted everywhere and layer-name references turned into indices.
fn resolve_layout(profile: &KeyboardProfile, layout: &LayoutData) -> Result<LayoutData> {
    let mut resolved = layout.clone();

    for layer_idx in 0..resolved.layers.len() {
        for pos in 0..resolved.layers[layer_idx].len() {
            let location = format!("layers[{layer_idx}][{pos}]");
            let binding = resolve_binding(&resolved.layers[layer_idx][pos], layout, &location)?;
            resolved.layers[layer_idx][pos] = binding;
        }
    }

    for (idx, mac) in resolved.macros.iter_mut().enumerate() {
        for (pos, binding) in mac.bindings.clone().iter().enumerate() {
            let location = format!("macros[{idx}].bindings[{pos}]");
            mac.bindings[pos] = resolve_binding_vars(binding, layout, &location)?;
        }
    }
    for (idx, combo) in resolved.combos.iter_mut().enumerate() {
        let location = format!("combos[{idx}].binding");
        combo.binding = resolve_binding_vars(&combo.binding.clone(), layout, &location)?;
    }
    for (idx, ht) in resolved.hold_taps.iter_mut().enumerate() {
        if let Some(flavor) = &ht.flavor {
            ht.flavor = Some(resolve_text(
                flavor,
                layout,
                &format!("hold_taps[{idx}].flavor"),
            )?);
        } else {
            // Unspecified flavor falls back to the profile's first allowed.
            ht.flavor = profile.zmk_config.hold_tap_flavors.first().cloned();
        }
    }
    for (idx, listener) in resolved.input_listeners.iter_mut().enumerate() {
        listener.content = resolve_text(
            &listener.content,
            layout,
            &format!("input_listeners[{idx}]"),
        )?;
    }

    Ok(resolved)
}

/// Substitutes variables and converts layer-name references to indices.
fn resolve_binding(binding: &Binding, layout: &LayoutData, location: &str) -> Result<Binding> {
    const LAYER_BEHAVIORS: &[&str] = &["&mo", "&lt", "&to", "&tog", "&sl"];

    let mut resolved = resolve_binding_vars(binding, layout, location)?;
    if LAYER_BEHAVIORS.contains(&resolved.value.as_str()) {
        if let Some(target) = resolved.params.first_mut() {
            if target.value.parse::<usize>().is_err() {
                let index = layout.layer_index(&target.value)?;
                target.value = index.to_string();
            }
        }
    }
    Ok(resolved)
}

fn resolve_binding_vars(
    binding: &Binding,
    layout: &LayoutData,
    location: &str,
) -> Result<Binding> {
    let value = resolve_text(&binding.value, layout, location)?;
    let params = binding
        .params
        .iter()
        .map(|p| resolve_binding_vars(p, layout, location))
        .collect::<Result<Vec<_>>>()?;
    Ok(Binding { value, params })
}

/// Replaces each `${name}` with the string form of `variables[name]`.
/// `${0}`/`${1}` pass through (macro parameter placeholders).
fn resolve_text(text: &str, layout: &LayoutData, location: &str) -> Result<String> {
    if !text.contains("${") {
        return Ok(text.to_string());
    }
    let mut out = String::with_capacity(text.len());
    let mut rest = text;
    while let Some(start) = rest.find("${") {
        out.push_str(&rest[..start]);
        let tail = &rest[start + 2..];
        let Some(end) = tail.find('}') else {
            out.push_str(&rest[start..]);
            return Ok(out);
        };
        let name = &tail[..end];
        if name == "0" || name == "1" {
            out.push_str(&rest[start..start + 2 + end + 1]);
        } else {
            let value = layout
                .variables
                .get(name)
                .ok_or_else(|| Error::UndefinedVariable {
                    name: name.to_string(),
                    location: location.to_string(),
                })?;
            out.push_str(&variable_string(value));
        }
        rest = &tail[end + 1..];
    }
    out.push_str(rest);
    Ok(out)
}

fn variable_string(value: &serde_json::Value) -> String {
    match value {
        serde_json::Value::String(s) => s.clone(),
        serde_json::Value::Bool(b) => b.to_string(),
        serde_json::Value::Number(n) => n.to_string(),
        other => other.to_string(),
    }
}

/// Profile-dependent hard errors.
fn validate(profile: &KeyboardProfile, layout: &LayoutData) -> Result<()> {
    let limits = &profile.zmk_config.validation_limits;

    for (idx, layer) in layout.layers.iter().enumerate() {
        if layer.len() != profile.key_count {
            return Err(Error::Validation(format!(
                "layer '{}' has {} bindings but keyboard '{}' has {} keys",
                layout.layer_names[idx],
                layer.len(),
                profile.keyboard_name,
                profile.key_count
            )));
        }
    }

    if layout.layers.len() > limits.max_layers {
        return Err(Error::LimitExceeded {
            what: "layer count".into(),
            got: layout.layers.len(),
            limit: limits.max_layers,
        });
    }

    for mac in &layout.macros {
        if mac.arity() > limits.max_macro_params {
            return Err(Error::LimitExceeded {
                what: format!("macro '{}' parameters", mac.name),
                got: mac.arity(),
                limit: limits.max_macro_params,
            });
        }
    }

    for ht in &layout.hold_taps {
        if ht.bindings.len() != limits.required_holdtap_bindings {
            return Err(Error::HoldTapBindings {
                expected: limits.required_holdtap_bindings,
                got: ht.bindings.len(),
            });
        }
        if let Some(flavor) = &ht.flavor {
            if !profile.zmk_config.hold_tap_flavors.contains(flavor) {
                return Err(Error::InvalidFlavor {
                    got: flavor.clone(),
                    allowed: profile.zmk_config.hold_tap_flavors.clone(),
                });
            }
        }
    }

    for combo in &layout.combos {
        for &layer in &combo.layers {
            if layer as usize >= layout.layers.len() {
                return Err(Error::UnknownLayer(layer.to_string()));
            }
        }
        for &position in &combo.key_positions {
            if position as usize >= profile.key_count {
                return Err(Error::Validation(format!(
                    "combo '{}' names key position {position} but keyboard '{}' has {} keys",
                    combo.name, profile.keyboard_name, profile.key_count
                )));
            }
        }
    }

    Ok(())
}

fn validate_bindings(registry: &BehaviorRegistry, layout: &LayoutData) -> Result<()> {
    for (layer_idx, layer) in layout.layers.iter().enumerate() {
        for (pos, binding) in layer.iter().enumerate() {
            registry.validate_binding(binding, &format!("layers[{layer_idx}][{pos}]"))?;
        }
    }
    for (idx, mac) in layout.macros.iter().enumerate() {
        for (pos, binding) in mac.bindings.iter().enumerate() {
            registry.validate_binding(binding, &format!("macros[{idx}].bindings[{pos}]"))?;
        }
    }
    for (idx, combo) in layout.combos.iter().enumerate() {
        registry.validate_binding(&combo.binding, &format!("combos[{idx}].binding"))?;
    }
    Ok(())
}

fn collect_warnings(
    profile: &KeyboardProfile,
    original: &LayoutData,
    resolved: &LayoutData,
) -> Vec<String> {
    let mut warnings = Vec::new();
    let limits = &profile.zmk_config.validation_limits;

    if resolved.layers.len() > limits.warn_many_layers_threshold {
        warnings.push(format!(
            "layout has {} layers; more than {} may be hard to manage",
            resolved.layers.len(),
            limits.warn_many_layers_threshold
        ));
    }

    // Unused variables: substitution has already run, so scan the original.
    for name in original.variables.keys() {
        let needle = format!("${{{name}}}");
        let mut used = false;
        for layer in &original.layers {
            for binding in layer {
                binding.walk(&mut |node| used = used || node.value.contains(&needle));
            }
        }
        for mac in &original.macros {
            for binding in &mac.bindings {
                binding.walk(&mut |node| used = used || node.value.contains(&needle));
            }
        }
        if !used {
            warnings.push(format!("variable '{name}' is defined but never used"));
        }
    }

    // Behaviors defined but never referenced from any layer or combo.
    let mut referenced = BTreeSet::new();
    for layer in &resolved.layers {
        for binding in layer {
            binding.collect_codes(&mut referenced);
        }
    }
    for combo in &resolved.combos {
        combo.binding.collect_codes(&mut referenced);
    }
    for mac in &resolved.macros {
        if !referenced.contains(&mac.code()) {
            warnings.push(format!("macro '{}' is defined but never used", mac.name));
        }
    }
    for ht in &resolved.hold_taps {
        if !referenced.contains(&ht.code()) {
            warnings.push(format!("hold-tap '{}' is defined but never used", ht.name));
        }
    }

    warnings
}
