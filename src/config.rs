// Interpreter settings, loadable from a RON file alongside the engine's
// other front-end configuration.

use ron::de::from_reader;
use serde::Deserialize;
use std::fs::File;


#[derive(Deserialize, Debug, Clone)]
#[serde(default)]
pub struct Settings {
    // log every function entry and return, with arguments and value
    pub trace: bool,
    // warn when a variable is read before any assignment
    pub warn_undefined_variables: bool,
    pub int_stack_depth: usize,
    pub float_stack_depth: usize,
}

impl Default for Settings {
    fn default() -> Settings {
        Settings {
            trace: false,
            warn_undefined_variables: false,
            int_stack_depth: 4096,
            float_stack_depth: 4096,
        }
    }
}

impl Settings {
    pub fn load(path: &str) -> Result<Settings, String> {
        let file = File::open(path).map_err(|e| e.to_string())?;
        from_reader(file).map_err(|e| e.to_string())
    }
}
