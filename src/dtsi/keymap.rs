//! `.keymap` emission: includes, behavior definitions, and layer nodes.

use crate::dtsi::format::format_grid;
use crate::error::Result;
use crate::layout::{LayoutData, MacroDef};
use crate::profile::KeyboardProfile;

/// Placeholder symbol ZMK macros use for forwarded parameters.
const MACRO_PLACEHOLDER: &str = "MACRO_PLACEHOLDER";

/// Emits the complete keymap source. Bindings must already have variables
/// and layer names resolved.
pub(crate) fn emit_keymap(
    profile: &KeyboardProfile,
    layout: &LayoutData,
    includes: &[String],
) -> Result<String> {
    let mut out = String::new();

    for include in includes {
        out.push_str(&format!("#include {include}\n"));
    }

    if let Some(custom) = &layout.custom_defined_behaviors {
        out.push('\n');
        push_fragment(&mut out, custom);
    }

    out.push_str("\n/ {\n");

    if !layout.macros.is_empty() {
        emit_macros(&mut out, profile, layout);
    }
    if !layout.hold_taps.is_empty() {
        emit_hold_taps(&mut out, profile, layout);
    }
    if !layout.combos.is_empty() {
        emit_combos(&mut out, profile, layout);
    }
    for listener in &layout.input_listeners {
        out.push_str(&format!("    {} {{\n", node_ident(&listener.code)));
        for line in listener.content.lines() {
            if line.trim().is_empty() {
                out.push('\n');
            } else {
                out.push_str(&format!("        {}\n", line.trim_end()));
            }
        }
        out.push_str("    };\n\n");
    }

    emit_layers(&mut out, profile, layout)?;

    out.push_str("};\n");

    if let Some(custom) = &layout.custom_devicetree {
        out.push('\n');
        push_fragment(&mut out, custom);
    }

    Ok(out)
}

fn emit_macros(out: &mut String, profile: &KeyboardProfile, layout: &LayoutData) {
    out.push_str("    macros {\n");
    for mac in &layout.macros {
        let ident = node_ident(&mac.name);
        let arity = mac.arity();
        out.push_str(&format!("        {ident}: {ident} {{\n"));
        out.push_str(&format!(
            "            compatible = \"{}\";\n",
            profile.zmk_config.compatible_macro
        ));
        out.push_str(&format!("            #binding-cells = <{arity}>;\n"));
        out.push_str(&format!(
            "            label = \"{}\";\n",
            mac.name.to_uppercase()
        ));
        if let Some(wait) = mac.wait_ms {
            out.push_str(&format!("            wait-ms = <{wait}>;\n"));
        }
        if let Some(tap) = mac.tap_ms {
            out.push_str(&format!("            tap-ms = <{tap}>;\n"));
        }
        out.push_str(&format!(
            "            bindings = {};\n",
            macro_bindings(mac)
        ));
        out.push_str("        };\n");
    }
    out.push_str("    };\n\n");
}

/// Macro sequences group consecutive bindings between operator behaviors:
/// `<&macro_tap>, <&kp U &kp S>`. Parameter placeholders become
/// `MACRO_PLACEHOLDER` as the firmware expects.
fn macro_bindings(mac: &MacroDef) -> String {
    let mut groups: Vec<Vec<String>> = Vec::new();
    for binding in &mac.bindings {
        let rendered = binding
            .map_values(&|v| v.replace("${0}", MACRO_PLACEHOLDER).replace("${1}", MACRO_PLACEHOLDER))
            .to_dtsi();
        let is_operator = binding.value.starts_with("&macro_");
        if is_operator {
            groups.push(vec![rendered]);
            groups.push(Vec::new());
        } else if let Some(last) = groups.last_mut() {
            last.push(rendered);
        } else {
            groups.push(vec![rendered]);
        }
    }
    let rendered: Vec<String> = groups
        .into_iter()
        .filter(|g| !g.is_empty())
        .map(|g| format!("<{}>", g.join(" ")))
        .collect();
    rendered.join(", ")
}

fn emit_hold_taps(out: &mut String, profile: &KeyboardProfile, layout: &LayoutData) {
    out.push_str("    behaviors {\n");
    for ht in &layout.hold_taps {
        let ident = node_ident(&ht.name);
        out.push_str(&format!("        {ident}: {ident} {{\n"));
        out.push_str(&format!(
            "            compatible = \"{}\";\n",
            profile.zmk_config.compatible_hold_tap
        ));
        out.push_str("            #binding-cells = <2>;\n");
        if let Some(flavor) = &ht.flavor {
            out.push_str(&format!("            flavor = \"{flavor}\";\n"));
        }
        if let Some(term) = ht.tapping_term_ms {
            out.push_str(&format!("            tapping-term-ms = <{term}>;\n"));
        }
        if let Some(quick) = ht.quick_tap_ms {
            out.push_str(&format!("            quick-tap-ms = <{quick}>;\n"));
        }
        if let Some(idle) = ht.require_prior_idle_ms {
            out.push_str(&format!("            require-prior-idle-ms = <{idle}>;\n"));
        }
        if !ht.hold_trigger_key_positions.is_empty() {
            let positions: Vec<String> = ht
                .hold_trigger_key_positions
                .iter()
                .map(ToString::to_string)
                .collect();
            out.push_str(&format!(
                "            hold-trigger-key-positions = <{}>;\n",
                positions.join(" ")
            ));
        }
        if ht.hold_trigger_on_release {
            out.push_str("            hold-trigger-on-release;\n");
        }
        let bindings: Vec<String> = ht.bindings.iter().map(|b| format!("<{b}>")).collect();
        out.push_str(&format!("            bindings = {};\n", bindings.join(", ")));
        out.push_str("        };\n");
    }
    out.push_str("    };\n\n");
}

fn emit_combos(out: &mut String, profile: &KeyboardProfile, layout: &LayoutData) {
    out.push_str("    combos {\n");
    out.push_str(&format!(
        "        compatible = \"{}\";\n",
        profile.zmk_config.compatible_combos
    ));
    for combo in &layout.combos {
        out.push_str(&format!("        combo_{} {{\n", node_ident(&combo.name)));
        if let Some(timeout) = combo.timeout_ms {
            out.push_str(&format!("            timeout-ms = <{timeout}>;\n"));
        }
        let positions: Vec<String> = combo.key_positions.iter().map(ToString::to_string).collect();
        out.push_str(&format!(
            "            key-positions = <{}>;\n",
            positions.join(" ")
        ));
        out.push_str(&format!(
            "            bindings = <{}>;\n",
            combo.binding.to_dtsi()
        ));
        if !combo.layers.is_empty() {
            let layers: Vec<String> = combo.layers.iter().map(ToString::to_string).collect();
            out.push_str(&format!("            layers = <{}>;\n", layers.join(" ")));
        }
        out.push_str("        };\n");
    }
    out.push_str("    };\n\n");
}

fn emit_layers(out: &mut String, profile: &KeyboardProfile, layout: &LayoutData) -> Result<()> {
    out.push_str("    keymap {\n");
    out.push_str("        compatible = \"zmk,keymap\";\n");
    let formatting = profile.keymap().formatting;

    for (index, name) in layout.layer_names.iter().enumerate() {
        out.push('\n');
        out.push_str(&format!("        layer_{} {{\n", node_ident(name)));
        let cells: Vec<String> = layout.layers[index].iter().map(|b| b.to_dtsi()).collect();
        if formatting.rows.is_empty() {
            out.push_str(&format!(
                "            bindings = < {} >;\n",
                cells.join(" ")
            ));
        } else {
            out.push_str("            bindings = <\n");
            out.push_str(&format_grid(&cells, &formatting)?);
            out.push_str("\n            >;\n");
        }
        out.push_str("        };\n");
    }
    out.push_str("    };\n");
    Ok(())
}

/// Devicetree node identifier: keeps case, replaces anything outside
/// `[A-Za-z0-9_-]` with `_`.
fn node_ident(name: &str) -> String {
    name.chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '_' || c == '-' {
                c
            } else {
                '_'
            }
        })
        .collect()
}

fn push_fragment(out: &mut String, fragment: &str) {
    for line in fragment.lines() {
        out.push_str(line.trim_end());
        out.push('\n');
    }
}
