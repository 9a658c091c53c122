//! Method resolution by name and signature.
//!
//! Lookup is late-bound against a module the patcher does not control, so
//! "absent" and "ambiguous" are distinct, explicit outcomes: a constraint
//! list that matches two methods is supposed to uniquely identify one, and
//! silently picking the first candidate would patch the wrong code.

use crate::image::{simple_name, AssemblyImage, MethodDef, MethodHandle};
use crate::{Error, Result};

/// How a target's parameter list is constrained.
#[derive(Debug, Clone)]
pub enum ParamConstraint {
    /// Any parameter list
    Any,
    /// Exact count and ordered full-name match
    Exact(Vec<String>),
    /// At least `min_count` parameters, first one matched by simple type
    /// name (the scripting compiler strips namespaces inconsistently, so
    /// game types are matched the way the original tool matched them)
    FirstSimple {
        /// Simple name of the first parameter's type
        simple_name: String,
        /// Minimum parameter count
        min_count: usize,
    },
}

/// Identifies exactly one method definition inside an image.
#[derive(Debug, Clone)]
pub struct MethodTarget {
    /// Exact, case-sensitive full name of the declaring type
    pub declaring_type: String,
    /// Exact method name
    pub name: String,
    /// Parameter-list constraint
    pub params: ParamConstraint,
    /// Optional return-type full-name constraint
    pub return_type: Option<String>,
    /// Require the candidate to have a body
    pub requires_body: bool,
}

impl MethodTarget {
    /// Target any method of `declaring_type` named `name` that has a body.
    #[must_use]
    pub fn new(declaring_type: &str, name: &str) -> MethodTarget {
        MethodTarget {
            declaring_type: declaring_type.to_string(),
            name: name.to_string(),
            params: ParamConstraint::Any,
            return_type: None,
            requires_body: true,
        }
    }

    /// Constrain to an exact ordered parameter-type full-name list.
    #[must_use]
    pub fn params(mut self, full_names: &[&str]) -> Self {
        self.params = ParamConstraint::Exact(full_names.iter().map(|s| s.to_string()).collect());
        self
    }

    /// Constrain the first parameter by simple type name.
    #[must_use]
    pub fn first_param_simple(mut self, simple: &str, min_count: usize) -> Self {
        self.params = ParamConstraint::FirstSimple {
            simple_name: simple.to_string(),
            min_count,
        };
        self
    }

    /// Constrain the return type by full name.
    #[must_use]
    pub fn returns(mut self, full_name: &str) -> Self {
        self.return_type = Some(full_name.to_string());
        self
    }

    fn matches(&self, image: &AssemblyImage, method: &MethodDef) -> bool {
        if method.name != self.name {
            return false;
        }
        if self.requires_body && method.body.is_none() {
            return false;
        }
        if let Some(wanted) = &self.return_type {
            if &image.type_sig_full_name(&method.signature.return_type) != wanted {
                return false;
            }
        }
        match &self.params {
            ParamConstraint::Any => true,
            ParamConstraint::Exact(wanted) => {
                method.signature.params.len() == wanted.len()
                    && method
                        .signature
                        .params
                        .iter()
                        .zip(wanted)
                        .all(|(sig, want)| &image.type_sig_full_name(sig) == want)
            }
            ParamConstraint::FirstSimple {
                simple_name: wanted,
                min_count,
            } => {
                method.signature.params.len() >= *min_count
                    && method.signature.params.first().is_some_and(|sig| {
                        simple_name(&image.type_sig_full_name(sig)) == wanted
                    })
            }
        }
    }
}

/// Find exactly one method matching `target`.
///
/// # Errors
/// [`Error::TypeNotFound`] when the declaring type is absent,
/// [`Error::MethodNotFound`] when no method carries the name,
/// [`Error::SignatureMismatch`] when named candidates exist but none satisfy
/// the constraints, and [`Error::AmbiguousMethod`] when more than one does.
pub fn resolve_method(image: &AssemblyImage, target: &MethodTarget) -> Result<MethodHandle> {
    let type_index = image
        .type_index(&target.declaring_type)
        .ok_or_else(|| Error::TypeNotFound(target.declaring_type.clone()))?;

    let type_def = &image.types[type_index];
    let named: Vec<usize> = type_def
        .methods
        .iter()
        .enumerate()
        .filter(|(_, m)| m.name == target.name)
        .map(|(i, _)| i)
        .collect();
    if named.is_empty() {
        return Err(Error::MethodNotFound {
            type_name: target.declaring_type.clone(),
            method_name: target.name.clone(),
        });
    }

    let matching: Vec<usize> = named
        .into_iter()
        .filter(|&i| target.matches(image, &type_def.methods[i]))
        .collect();

    match matching.len() {
        0 => Err(Error::SignatureMismatch {
            type_name: target.declaring_type.clone(),
            method_name: target.name.clone(),
            details: "no overload satisfies the parameter/return constraints".into(),
        }),
        1 => Ok(MethodHandle {
            type_index,
            method_index: matching[0],
        }),
        count => Err(Error::AmbiguousMethod {
            type_name: target.declaring_type.clone(),
            method_name: target.name.clone(),
            count,
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::image::{ImageBuilder, MethodSig, TypeSig};

    fn image_with_overloads() -> AssemblyImage {
        ImageBuilder::new("Scripts")
            .type_def("LabelObject", |t| {
                t.method(
                    "SetText",
                    MethodSig::instance(TypeSig::Void, vec![TypeSig::String]),
                    |m| {
                        m.body(|b| {
                            b.ret();
                        })
                    },
                )
                .method(
                    "SetText",
                    MethodSig::instance(TypeSig::Void, vec![TypeSig::String, TypeSig::Boolean]),
                    |m| {
                        m.body(|b| {
                            b.ret();
                        })
                    },
                )
            })
            .build()
    }

    #[test]
    fn test_exact_params_select_single_overload() -> Result<()> {
        let image = image_with_overloads();
        let handle = resolve_method(
            &image,
            &MethodTarget::new("LabelObject", "SetText").params(&["System.String"]),
        )?;
        assert_eq!(handle.method_index, 0);
        Ok(())
    }

    #[test]
    fn test_unconstrained_overloads_are_ambiguous() {
        let image = image_with_overloads();
        let result = resolve_method(&image, &MethodTarget::new("LabelObject", "SetText"));
        assert!(matches!(
            result,
            Err(Error::AmbiguousMethod { count: 2, .. })
        ));
    }

    #[test]
    fn test_missing_type_and_method_are_distinct_errors() {
        let image = image_with_overloads();
        assert!(matches!(
            resolve_method(&image, &MethodTarget::new("Girl", "SetText")),
            Err(Error::TypeNotFound(_))
        ));
        assert!(matches!(
            resolve_method(&image, &MethodTarget::new("LabelObject", "Hide")),
            Err(Error::MethodNotFound { .. })
        ));
    }

    #[test]
    fn test_constraint_mismatch_is_signature_error() {
        let image = image_with_overloads();
        let result = resolve_method(
            &image,
            &MethodTarget::new("LabelObject", "SetText").params(&["System.Int32"]),
        );
        assert!(matches!(result, Err(Error::SignatureMismatch { .. })));
    }

    #[test]
    fn test_return_type_constraint() {
        let image = image_with_overloads();
        let result = resolve_method(
            &image,
            &MethodTarget::new("LabelObject", "SetText")
                .params(&["System.String"])
                .returns("System.String"),
        );
        assert!(matches!(result, Err(Error::SignatureMismatch { .. })));
    }

    #[test]
    fn test_first_param_simple_name_match() -> Result<()> {
        let image = ImageBuilder::new("Scripts")
            .type_def("DialogLine", |t| t)
            .type_def("Girl", |t| {
                t.method(
                    "ReadDialogLine",
                    MethodSig::instance(
                        TypeSig::Void,
                        vec![
                            TypeSig::Class(crate::image::Token::from_parts(
                                crate::image::token::table::TYPE_DEF,
                                1,
                            )),
                            TypeSig::Boolean,
                        ],
                    ),
                    |m| {
                        m.body(|b| {
                            b.ret();
                        })
                    },
                )
            })
            .build();

        let handle = resolve_method(
            &image,
            &MethodTarget::new("Girl", "ReadDialogLine").first_param_simple("DialogLine", 1),
        )?;
        assert_eq!(image.method(handle).name, "ReadDialogLine");
        Ok(())
    }
}
