// cvar.rs: named configuration variables
//
// Every tunable of the core is a cvar: created with a default on first use,
// optionally overridden from a startup script of `set <name> <value>` lines,
// and read back as a float or a string.

use std::collections::HashMap;
use std::path::Path;

/// Value cannot be changed after creation (except by `force_set`).
pub const CVAR_NOSET: i32 = 1;
/// Change takes effect on the next restart of the owning subsystem.
pub const CVAR_LATCH: i32 = 2;

/// A configuration variable.
#[derive(Clone, Debug)]
pub struct Cvar {
    pub name: String,
    pub string: String,
    pub latched_string: Option<String>,
    pub flags: i32,
    pub modified: bool,
    pub value: f32,
}

/// The cvar table.
#[derive(Default)]
pub struct CvarContext {
    pub cvar_vars: Vec<Cvar>,
    cvar_index: HashMap<String, usize>,
}

fn parse_value(s: &str) -> f32 {
    s.trim().parse::<f32>().unwrap_or(0.0)
}

impl CvarContext {
    pub fn new() -> Self {
        Self::default()
    }

    /// Find a cvar by name, returning its index.
    pub fn find_var_index(&self, name: &str) -> Option<usize> {
        self.cvar_index.get(name).copied()
    }

    pub fn find_var(&self, name: &str) -> Option<&Cvar> {
        self.cvar_index.get(name).map(|&idx| &self.cvar_vars[idx])
    }

    /// Get the floating-point value of a cvar. Returns 0 if not found.
    pub fn variable_value(&self, name: &str) -> f32 {
        self.find_var(name).map_or(0.0, |var| var.value)
    }

    /// Get the string value of a cvar. Returns "" if not found.
    pub fn variable_string(&self, name: &str) -> &str {
        self.find_var(name).map_or("", |var| var.string.as_str())
    }

    /// Get or create a cvar. If it already exists the value is kept and the
    /// flags are OR'd in.
    pub fn get(&mut self, name: &str, value: &str, flags: i32) -> usize {
        if let Some(&idx) = self.cvar_index.get(name) {
            self.cvar_vars[idx].flags |= flags;
            return idx;
        }

        let idx = self.cvar_vars.len();
        self.cvar_vars.push(Cvar {
            name: name.to_string(),
            string: value.to_string(),
            latched_string: None,
            flags,
            modified: true,
            value: parse_value(value),
        });
        self.cvar_index.insert(name.to_string(), idx);
        idx
    }

    fn set2(&mut self, name: &str, value: &str, force: bool) -> usize {
        let idx = match self.find_var_index(name) {
            Some(idx) => idx,
            None => return self.get(name, value, 0),
        };
        let var = &mut self.cvar_vars[idx];

        if !force {
            if var.flags & CVAR_NOSET != 0 {
                log::warn!("{} is write protected.", name);
                return idx;
            }
            if var.flags & CVAR_LATCH != 0 {
                if var.latched_string.as_deref() != Some(value) && var.string != value {
                    log::info!("{} will be changed on restart.", name);
                    var.latched_string = Some(value.to_string());
                }
                return idx;
            }
        } else {
            var.latched_string = None;
        }

        if var.string == value {
            return idx;
        }
        var.modified = true;
        var.string = value.to_string();
        var.value = parse_value(value);
        idx
    }

    /// Set a cvar value (respects NOSET and LATCH flags).
    pub fn set(&mut self, name: &str, value: &str) -> usize {
        self.set2(name, value, false)
    }

    /// Force-set a cvar value (ignores NOSET and LATCH).
    pub fn force_set(&mut self, name: &str, value: &str) -> usize {
        self.set2(name, value, true)
    }

    /// Set a cvar from a float value.
    pub fn set_value(&mut self, name: &str, value: f32) {
        let val_str = if value == (value as i32) as f32 {
            format!("{}", value as i32)
        } else {
            format!("{}", value)
        };
        self.set(name, &val_str);
    }

    /// Apply all latched variable changes.
    pub fn get_latched_vars(&mut self) {
        for var in &mut self.cvar_vars {
            if let Some(latched) = var.latched_string.take() {
                var.value = parse_value(&latched);
                var.string = latched;
                var.modified = true;
            }
        }
    }

    /// Run a config script. Lines are `set <name> <value>` (value may be
    /// quoted); blank lines and `//` or `#` comments are skipped. Returns the
    /// number of variables set.
    pub fn execute(&mut self, script: &str) -> usize {
        let mut count = 0;
        for (lineno, raw) in script.lines().enumerate() {
            let line = raw.trim();
            if line.is_empty() || line.starts_with("//") || line.starts_with('#') {
                continue;
            }
            let mut parts = line.splitn(3, char::is_whitespace);
            let cmd = parts.next().unwrap_or("");
            let name = parts.next().unwrap_or("").trim();
            let value = parts.next().unwrap_or("").trim().trim_matches('"');
            if cmd != "set" || name.is_empty() {
                log::warn!("config line {}: unrecognized '{}'", lineno + 1, line);
                continue;
            }
            self.set(name, value);
            count += 1;
        }
        count
    }

    /// Run a config script from disk. A missing file is not an error.
    pub fn execute_file(&mut self, path: &Path) -> usize {
        match std::fs::read_to_string(path) {
            Ok(text) => self.execute(&text),
            Err(e) => {
                log::debug!("no config at {}: {}", path.display(), e);
                0
            }
        }
    }

    /// Write all variables back as a script `execute` can read.
    pub fn write_variables(&self, writer: &mut dyn std::io::Write) -> std::io::Result<()> {
        for var in &self.cvar_vars {
            writeln!(writer, "set {} \"{}\"", var.name, var.string)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cvar_get_and_find() {
        let mut ctx = CvarContext::new();
        ctx.get("vk_frames_in_flight", "3", 0);
        assert_eq!(ctx.variable_value("vk_frames_in_flight"), 3.0);
        assert_eq!(ctx.variable_string("vk_frames_in_flight"), "3");
        assert_eq!(ctx.variable_value("missing"), 0.0);
        assert_eq!(ctx.variable_string("missing"), "");
    }

    #[test]
    fn test_cvar_get_keeps_existing_value() {
        let mut ctx = CvarContext::new();
        let a = ctx.get("x", "10", 0);
        let b = ctx.get("x", "99", CVAR_LATCH);
        assert_eq!(a, b);
        assert_eq!(ctx.variable_value("x"), 10.0);
        assert_eq!(ctx.find_var("x").unwrap().flags, CVAR_LATCH);
    }

    #[test]
    fn test_cvar_noset() {
        let mut ctx = CvarContext::new();
        ctx.get("x", "10", CVAR_NOSET);
        ctx.set("x", "20");
        assert_eq!(ctx.variable_value("x"), 10.0);
        ctx.force_set("x", "20");
        assert_eq!(ctx.variable_value("x"), 20.0);
    }

    #[test]
    fn test_cvar_latch() {
        let mut ctx = CvarContext::new();
        ctx.get("x", "1", CVAR_LATCH);
        ctx.set("x", "2");
        assert_eq!(ctx.variable_value("x"), 1.0);
        ctx.get_latched_vars();
        assert_eq!(ctx.variable_value("x"), 2.0);
    }

    #[test]
    fn test_cvar_set_value_formats_integers() {
        let mut ctx = CvarContext::new();
        ctx.set_value("x", 4.0);
        assert_eq!(ctx.variable_string("x"), "4");
        ctx.set_value("x", 0.5);
        assert_eq!(ctx.variable_string("x"), "0.5");
    }

    #[test]
    fn test_execute_script() {
        let mut ctx = CvarContext::new();
        let script = "// core settings\n\
                      set vk_frames_in_flight 2\n\
                      \n\
                      # comment\n\
                      set vk_texture_cache_dir \"cache/textures\"\n\
                      bogus line\n";
        assert_eq!(ctx.execute(script), 2);
        assert_eq!(ctx.variable_value("vk_frames_in_flight"), 2.0);
        assert_eq!(ctx.variable_string("vk_texture_cache_dir"), "cache/textures");
    }

    #[test]
    fn test_write_then_execute() {
        let mut ctx = CvarContext::new();
        ctx.get("a", "1", 0);
        ctx.get("b", "two words", 0);
        let mut out = Vec::new();
        ctx.write_variables(&mut out).unwrap();

        let mut other = CvarContext::new();
        other.execute(std::str::from_utf8(&out).unwrap());
        assert_eq!(other.variable_string("a"), "1");
        assert_eq!(other.variable_string("b"), "two words");
    }

    #[test]
    fn test_execute_file() {
        let dir = std::env::temp_dir().join(format!("astra_cvar_{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("core.cfg");
        std::fs::write(&path, "set vk_validation 1\n").unwrap();

        let mut ctx = CvarContext::new();
        assert_eq!(ctx.execute_file(&path), 1);
        assert_eq!(ctx.variable_value("vk_validation"), 1.0);
        assert_eq!(ctx.execute_file(&dir.join("missing.cfg")), 0);

        std::fs::remove_dir_all(&dir).ok();
    }
}
