//! Compose file discovery, interpolation, merging, and validation.

use super::{
    dependency_order, ComposeError, ComposeFile, NetworkConfig, Project, ServiceNetworks,
    VolumeConfig, DEFAULT_NETWORK_KEY,
};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

pub const COMPOSE_FILE_NAMES: &[&str] = &[
    "compose.yaml",
    "compose.yml",
    "docker-compose.yml",
    "docker-compose.yaml",
];

/// Inputs for loading a project.
#[derive(Debug, Clone, Default)]
pub struct LoadOptions {
    /// `-f` files; when empty the first of [`COMPOSE_FILE_NAMES`] in `cwd` is used.
    pub files: Vec<PathBuf>,
    pub project_dir: Option<PathBuf>,
    /// `-p`
    pub project_name: Option<String>,
    /// Host environment; overrides the project `.env` file.
    pub environment: BTreeMap<String, String>,
    pub cwd: PathBuf,
}

pub fn find_compose_file(dir: &Path) -> Option<PathBuf> {
    COMPOSE_FILE_NAMES
        .iter()
        .map(|n| dir.join(n))
        .find(|p| p.is_file())
}

/// Lowercase and strip characters not allowed in project names.
pub fn normalize_project_name(raw: &str) -> String {
    let lowered: String = raw
        .to_lowercase()
        .chars()
        .filter(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '-'))
        .collect();
    lowered
        .trim_start_matches(|c: char| !c.is_ascii_alphanumeric())
        .to_owned()
}

/// Parse a `.env` file. Values may be wrapped in single or double quotes.
pub fn parse_dotenv(content: &str) -> BTreeMap<String, String> {
    let mut out = BTreeMap::new();
    for line in content.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let line = line.strip_prefix("export ").unwrap_or(line);
        let Some((k, v)) = line.split_once('=') else {
            continue;
        };
        let v = v.trim();
        let v = if v.len() >= 2
            && ((v.starts_with('"') && v.ends_with('"'))
                || (v.starts_with('\'') && v.ends_with('\'')))
        {
            &v[1..v.len() - 1]
        } else {
            v
        };
        out.insert(k.trim().to_owned(), v.to_owned());
    }
    out
}

fn is_name_char(c: char, first: bool) -> bool {
    c == '_' || c.is_ascii_alphabetic() || (!first && c.is_ascii_digit())
}

/// Expand `${VAR}`, `${VAR:-d}`, `${VAR-d}`, `${VAR:?err}`, `${VAR?err}`,
/// `${VAR:+alt}`, `${VAR+alt}`, `$VAR`, and `$$`.
///
/// Returns the expanded text and the names of referenced variables that were
/// not set and had no default.
pub fn interpolate(
    text: &str,
    lookup: &dyn Fn(&str) -> Option<String>,
) -> Result<(String, Vec<String>), ComposeError> {
    let mut out = String::with_capacity(text.len());
    let mut unset = Vec::new();
    let chars: Vec<char> = text.chars().collect();
    let mut i = 0;
    while i < chars.len() {
        let c = chars[i];
        if c != '$' {
            out.push(c);
            i += 1;
            continue;
        }
        match chars.get(i + 1) {
            Some('$') => {
                out.push('$');
                i += 2;
            }
            Some('{') => {
                let start = i + 2;
                let mut depth = 1;
                let mut j = start;
                while j < chars.len() {
                    match chars[j] {
                        '{' => depth += 1,
                        '}' => {
                            depth -= 1;
                            if depth == 0 {
                                break;
                            }
                        }
                        _ => {}
                    }
                    j += 1;
                }
                if j >= chars.len() {
                    return Err(ComposeError::Interpolation(format!(
                        "unterminated variable reference in '{}'",
                        chars[i..].iter().collect::<String>()
                    )));
                }
                let body: String = chars[start..j].iter().collect();
                out.push_str(&expand_braced(&body, lookup, &mut unset)?);
                i = j + 1;
            }
            Some(&n) if is_name_char(n, true) => {
                let mut j = i + 1;
                while j < chars.len() && is_name_char(chars[j], false) {
                    j += 1;
                }
                let name: String = chars[i + 1..j].iter().collect();
                match lookup(&name) {
                    Some(v) => out.push_str(&v),
                    None => push_unset(&mut unset, &name),
                }
                i = j;
            }
            _ => {
                out.push('$');
                i += 1;
            }
        }
    }
    Ok((out, unset))
}

fn push_unset(unset: &mut Vec<String>, name: &str) {
    if !unset.iter().any(|n| n == name) {
        unset.push(name.to_owned());
    }
}

fn expand_braced(
    body: &str,
    lookup: &dyn Fn(&str) -> Option<String>,
    unset: &mut Vec<String>,
) -> Result<String, ComposeError> {
    let name_end = body
        .char_indices()
        .find(|(idx, c)| !is_name_char(*c, *idx == 0))
        .map_or(body.len(), |(idx, _)| idx);
    let name = &body[..name_end];
    if name.is_empty() {
        return Err(ComposeError::Interpolation(format!(
            "invalid variable reference '${{{body}}}'"
        )));
    }
    let rest = &body[name_end..];
    let value = lookup(name);
    let nested = |s: &str, unset: &mut Vec<String>| -> Result<String, ComposeError> {
        let (text, missing) = interpolate(s, lookup)?;
        for m in missing {
            push_unset(unset, &m);
        }
        Ok(text)
    };

    if rest.is_empty() {
        return Ok(value.unwrap_or_else(|| {
            push_unset(unset, name);
            String::new()
        }));
    }
    let (op, arg) = if let Some(a) = rest.strip_prefix(":-") {
        (":-", a)
    } else if let Some(a) = rest.strip_prefix(":?") {
        (":?", a)
    } else if let Some(a) = rest.strip_prefix(":+") {
        (":+", a)
    } else if let Some(a) = rest.strip_prefix('-') {
        ("-", a)
    } else if let Some(a) = rest.strip_prefix('?') {
        ("?", a)
    } else if let Some(a) = rest.strip_prefix('+') {
        ("+", a)
    } else {
        return Err(ComposeError::Interpolation(format!(
            "invalid variable reference '${{{body}}}'"
        )));
    };

    let set_nonempty = value.as_deref().is_some_and(|v| !v.is_empty());
    match op {
        ":-" if set_nonempty => Ok(value.unwrap_or_default()),
        "-" if value.is_some() => Ok(value.unwrap_or_default()),
        ":-" | "-" => nested(arg, unset),
        ":?" if !set_nonempty => Err(ComposeError::Interpolation(format!(
            "required variable {name} is missing a value: {arg}"
        ))),
        "?" if value.is_none() => Err(ComposeError::Interpolation(format!(
            "required variable {name} is missing a value: {arg}"
        ))),
        ":+" if set_nonempty => nested(arg, unset),
        "+" if value.is_some() => nested(arg, unset),
        ":+" | "+" => Ok(String::new()),
        _ => Ok(value.unwrap_or_default()),
    }
}

/// Deep-merge `overlay` into `base`: mappings merge key by key, everything else replaces.
fn merge_yaml(base: &mut serde_yaml::Value, overlay: serde_yaml::Value) {
    match (base, overlay) {
        (serde_yaml::Value::Mapping(b), serde_yaml::Value::Mapping(o)) => {
            for (k, v) in o {
                match b.get_mut(&k) {
                    Some(existing) => merge_yaml(existing, v),
                    None => {
                        b.insert(k, v);
                    }
                }
            }
        }
        (slot, v) => *slot = v,
    }
}

impl LoadOptions {
    fn resolve_files(&self) -> Result<Vec<PathBuf>, ComposeError> {
        if !self.files.is_empty() {
            return Ok(self
                .files
                .iter()
                .map(|f| {
                    if f.is_absolute() {
                        f.clone()
                    } else {
                        self.cwd.join(f)
                    }
                })
                .collect());
        }
        let dir = self.project_dir.clone().unwrap_or_else(|| self.cwd.clone());
        find_compose_file(&dir)
            .map(|f| vec![f])
            .ok_or_else(|| ComposeError::NoFile(dir.display().to_string()))
    }

    pub fn load(&self) -> Result<Project, ComposeError> {
        let files = self.resolve_files()?;
        let working_dir = match &self.project_dir {
            Some(d) => d.clone(),
            None => files[0]
                .parent()
                .map_or_else(|| self.cwd.clone(), Path::to_path_buf),
        };

        let mut env = match std::fs::read_to_string(working_dir.join(".env")) {
            Ok(content) => parse_dotenv(&content),
            Err(_) => BTreeMap::new(),
        };
        env.extend(self.environment.clone());
        let lookup = |k: &str| env.get(k).cloned();

        let mut merged = serde_yaml::Value::Mapping(serde_yaml::Mapping::new());
        let mut unset_variables = Vec::new();
        for file in &files {
            let raw = std::fs::read_to_string(file).map_err(|source| ComposeError::Read {
                path: file.display().to_string(),
                source,
            })?;
            let (text, missing) = interpolate(&raw, &lookup)?;
            for m in missing {
                push_unset(&mut unset_variables, &m);
            }
            let value: serde_yaml::Value =
                serde_yaml::from_str(&text).map_err(|e| ComposeError::Yaml {
                    path: file.display().to_string(),
                    message: e.to_string(),
                })?;
            if !value.is_null() {
                merge_yaml(&mut merged, value);
            }
        }
        let doc: ComposeFile =
            serde_yaml::from_value(merged).map_err(|e| ComposeError::Yaml {
                path: files[0].display().to_string(),
                message: e.to_string(),
            })?;

        let raw_name = self
            .project_name
            .clone()
            .or_else(|| lookup("COMPOSE_PROJECT_NAME").filter(|n| !n.is_empty()))
            .or_else(|| doc.name.clone())
            .or_else(|| {
                working_dir
                    .file_name()
                    .map(|n| n.to_string_lossy().into_owned())
            })
            .unwrap_or_default();
        let name = normalize_project_name(&raw_name);
        if name.is_empty() {
            return Err(ComposeError::Invalid(format!(
                "invalid project name '{raw_name}'"
            )));
        }

        let mut project = Project {
            name,
            working_dir,
            services: Vec::new(),
            networks: doc
                .networks
                .into_iter()
                .map(|(k, v)| (k, v.unwrap_or_default()))
                .collect(),
            volumes: doc
                .volumes
                .into_iter()
                .map(|(k, v)| (k, v.unwrap_or_else(VolumeConfig::default)))
                .collect(),
            secrets: doc.secrets,
            configs: doc.configs,
            unset_variables,
        };

        for (svc_name, mut svc) in doc.services {
            svc.name.clone_from(&svc_name);
            if svc.networks.is_none() && svc.network_mode.is_none() && svc.net.is_none() {
                svc.networks = Some(ServiceNetworks::List(vec![DEFAULT_NETWORK_KEY.to_owned()]));
            }
            project.services.push(svc);
        }
        let uses_default = project
            .services
            .iter()
            .any(|s| s.network_names().iter().any(|n| n == DEFAULT_NETWORK_KEY));
        if uses_default {
            project
                .networks
                .entry(DEFAULT_NETWORK_KEY.to_owned())
                .or_insert_with(NetworkConfig::default);
        }

        validate(&project)?;
        Ok(project)
    }
}

fn validate(project: &Project) -> Result<(), ComposeError> {
    for svc in &project.services {
        if svc.image.is_none() && svc.build.is_none() {
            return Err(ComposeError::Invalid(format!(
                "service '{}' has neither an image nor a build context",
                svc.name
            )));
        }
        for dep in svc.dependencies() {
            if !project.services.iter().any(|s| s.name == dep) {
                return Err(ComposeError::Invalid(format!(
                    "service '{}' depends on undefined service '{dep}'",
                    svc.name
                )));
            }
        }
        for net in svc.network_names() {
            if !project.networks.contains_key(&net) {
                return Err(ComposeError::Invalid(format!(
                    "service '{}' refers to undefined network '{net}'",
                    svc.name
                )));
            }
        }
        for s in &svc.secrets {
            if !project.secrets.contains_key(s.source()) {
                return Err(ComposeError::Invalid(format!(
                    "service '{}' refers to undefined secret '{}'",
                    svc.name,
                    s.source()
                )));
            }
        }
        for c in &svc.configs {
            if !project.configs.contains_key(c.source()) {
                return Err(ComposeError::Invalid(format!(
                    "service '{}' refers to undefined config '{}'",
                    svc.name,
                    c.source()
                )));
            }
        }
    }
    dependency_order(&project.services)?;
    Ok(())
}
