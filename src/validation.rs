use std::fmt;

use rustc_hash::FxHashMap;

use crate::config::AppSettings;

pub const MIN_PIN: i32 = 1;
pub const MAX_PIN: i32 = 40;

/// Every violation found in one configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidationErrors(pub Vec<String>);

impl ValidationErrors {
    pub fn errors(&self) -> &[String] {
        &self.0
    }
}

impl fmt::Display for ValidationErrors {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Configuration validation failed:")?;
        for error in &self.0 {
            writeln!(f, " - {error}")?;
        }
        Ok(())
    }
}

impl std::error::Error for ValidationErrors {}

pub fn validate(settings: &AppSettings) -> Result<(), ValidationErrors> {
    let mut errors = Vec::new();

    validate_routes(settings, &mut errors);
    validate_server(settings, &mut errors);
    validate_defaults(settings, &mut errors);
    validate_buttons(settings, &mut errors);
    validate_inactive_relay(settings, &mut errors);
    validate_pin_assignments(settings, &mut errors);

    if errors.is_empty() {
        Ok(())
    } else {
        Err(ValidationErrors(errors))
    }
}

fn pin_range_error(what: &str, pin: i32) -> Option<String> {
    if pin < MIN_PIN {
        Some(format!(
            "{what} has an invalid pin '{pin}'. Pin must be greater than 0."
        ))
    } else if pin > MAX_PIN {
        Some(format!(
            "{what} has pin '{pin}' which exceeds maximum valid pin ({MAX_PIN})."
        ))
    } else {
        None
    }
}

fn validate_routes(settings: &AppSettings, errors: &mut Vec<String>) {
    if settings.routes.is_empty() {
        errors.push("At least one route must be configured.".into());
        return;
    }

    let mut seen: Vec<(String, String)> = Vec::new();
    for route in &settings.routes {
        let source_missing = route.source_name.trim().is_empty();
        let output_missing = route.output_name.trim().is_empty();

        if source_missing {
            errors.push("A route is missing a source name.".into());
        }
        if output_missing {
            let source = if source_missing {
                "<unknown>"
            } else {
                route.source_name.as_str()
            };
            errors.push(format!(
                "Route for source '{source}' is missing an output name."
            ));
        }

        let what = format!("Route {}->{}", route.source_name, route.output_name);
        if let Some(error) = pin_range_error(&what, route.relay_pin) {
            errors.push(error);
        }

        if !source_missing && !output_missing {
            let key = (
                route.source_name.to_ascii_lowercase(),
                route.output_name.to_ascii_lowercase(),
            );
            if seen.contains(&key) {
                errors.push(format!(
                    "Duplicate route detected for '{}' -> '{}'.",
                    route.source_name, route.output_name
                ));
            } else {
                seen.push(key);
            }
        }
    }
}

fn validate_server(settings: &AppSettings, errors: &mut Vec<String>) {
    if settings.server_port == 0 {
        errors.push("Server port '0' must be between 1 and 65535.".into());
    }

    let address = settings
        .tcp_mirror_address
        .as_deref()
        .filter(|a| !a.trim().is_empty());
    match (address, settings.tcp_mirror_port) {
        (Some(address), None) => errors.push(format!(
            "TCP mirror address '{address}' is configured without a TCP mirror port."
        )),
        (None, Some(port)) => errors.push(format!(
            "TCP mirror port '{port}' is configured without a TCP mirror address."
        )),
        (_, Some(0)) => errors.push("TCP mirror port '0' must be between 1 and 65535.".into()),
        _ => {}
    }
}

fn validate_defaults(settings: &AppSettings, errors: &mut Vec<String>) {
    for (source, output) in &settings.default_routes {
        if settings.find_route(source, output).is_none() {
            errors.push(format!(
                "Default route '{source}' -> '{output}' does not match any configured route."
            ));
        }
    }

    if let Some(source) = &settings.default_source
        && settings.find_source(source).is_none()
    {
        errors.push(format!("Default source '{source}' is not a configured source."));
    }
}

fn validate_buttons(settings: &AppSettings, errors: &mut Vec<String>) {
    let mut names: Vec<&String> = settings.physical_source_buttons.keys().collect();
    names.sort();

    for source in names {
        let button = &settings.physical_source_buttons[source];
        if settings.find_source(source).is_none() {
            errors.push(format!(
                "Physical button configured for unknown source '{source}'."
            ));
        }

        let what = format!("Physical button for source '{source}'");
        if let Some(error) = pin_range_error(&what, button.pin_number) {
            errors.push(error);
        }
    }
}

fn validate_inactive_relay(settings: &AppSettings, errors: &mut Vec<String>) {
    if let Some(relay) = &settings.inactive_relay
        && let Some(error) = pin_range_error("Inactive relay", relay.pin)
    {
        errors.push(error);
    }
}

/// A physical line can serve a single role.
fn validate_pin_assignments(settings: &AppSettings, errors: &mut Vec<String>) {
    let mut owners: FxHashMap<i32, String> = FxHashMap::default();
    let mut claim = |pin: i32, owner: String, errors: &mut Vec<String>| {
        if !(MIN_PIN..=MAX_PIN).contains(&pin) {
            return;
        }
        match owners.get(&pin) {
            Some(existing) => errors.push(format!(
                "Pin {pin} is assigned to both {existing} and {owner}."
            )),
            None => {
                owners.insert(pin, owner);
            }
        }
    };

    for route in &settings.routes {
        claim(
            route.relay_pin,
            format!("route {}->{}", route.source_name, route.output_name),
            errors,
        );
    }

    let mut buttons: Vec<_> = settings.physical_source_buttons.iter().collect();
    buttons.sort_by(|a, b| a.0.cmp(b.0));
    for (source, button) in buttons {
        claim(
            button.pin_number,
            format!("the physical button for '{source}'"),
            errors,
        );
    }

    if let Some(relay) = &settings.inactive_relay {
        claim(relay.pin, "the inactive relay".to_string(), errors);
    }
}
