use crate::config::types::{GradeError, Result};
use crate::runner::languages::python::PythonAdapter;
use crate::runner::LanguageAdapter;

pub fn adapter_for(language: &str) -> Result<Box<dyn LanguageAdapter>> {
    match language {
        "python" | "py" | "python3" => Ok(Box::new(PythonAdapter::default())),
        _ => Err(GradeError::Config(format!(
            "unsupported language adapter: {language}"
        ))),
    }
}
