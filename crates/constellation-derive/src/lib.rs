//! Procedural macros for Constellation's typed value model.
//!
//! This crate provides a single derive macro, [`macro@ValueType`], which
//! generates the `typeOf`/`inject`/`extract` boilerplate described in the
//! engine's type-and-value model (`spec.md` §4.1 / §9): a static `CType`
//! description captured once at derive time, plus tabular conversion
//! functions, instead of per-call runtime reflection of the annotated
//! struct's fields.
//!
//! # Example
//!
//! ```ignore
//! use constellation::CValue;
//! use constellation_derive::ValueType;
//!
//! #[derive(Debug, Clone, ValueType)]
//! struct Point {
//!     x: i64,
//!     y: i64,
//! }
//!
//! let p = Point { x: 3, y: 4 };
//! let value: CValue = p.clone().inject();
//! let back = Point::extract(&value).unwrap();
//! assert_eq!(back.x, p.x);
//! ```

use proc_macro::TokenStream;
use quote::quote;
use syn::{parse_macro_input, Data, DeriveInput, Fields};

/// Derive `typeOf`/`inject`/`extract` for a record (product) type.
///
/// Every field's type must itself implement the `Injectable`/`Extractable`
/// conversions the engine expects (primitives, `Option<T>`, `Vec<T>`,
/// `HashMap<String, T>`, and other `ValueType`-derived structs all qualify).
#[proc_macro_derive(ValueType)]
pub fn derive_value_type(input: TokenStream) -> TokenStream {
    let input = parse_macro_input!(input as DeriveInput);
    let name = &input.ident;

    let fields = match &input.data {
        Data::Struct(data) => match &data.fields {
            Fields::Named(named) => &named.named,
            _ => {
                return syn::Error::new_spanned(
                    &input.ident,
                    "ValueType only supports structs with named fields",
                )
                .to_compile_error()
                .into()
            }
        },
        _ => {
            return syn::Error::new_spanned(
                &input.ident,
                "ValueType can only be derived for structs",
            )
            .to_compile_error()
            .into()
        }
    };

    let field_idents: Vec<_> = fields.iter().map(|f| f.ident.clone().unwrap()).collect();
    let field_names: Vec<String> = field_idents.iter().map(|i| i.to_string()).collect();
    let field_types: Vec<_> = fields.iter().map(|f| f.ty.clone()).collect();

    let expanded = quote! {
        impl ::constellation::value::ValueType for #name {
            fn type_of() -> ::constellation::types::CType {
                let mut fields = ::std::collections::BTreeMap::new();
                #(
                    fields.insert(
                        #field_names.to_string(),
                        <#field_types as ::constellation::value::ValueType>::type_of(),
                    );
                )*
                ::constellation::types::CType::Product(fields)
            }

            fn inject(self) -> ::constellation::value::CValue {
                let mut fields = ::std::collections::BTreeMap::new();
                #(
                    fields.insert(
                        #field_names.to_string(),
                        ::constellation::value::ValueType::inject(self.#field_idents),
                    );
                )*
                ::constellation::value::CValue::Product(fields)
            }

            fn extract(value: &::constellation::value::CValue) -> ::constellation::error::Result<Self> {
                match value {
                    ::constellation::value::CValue::Product(fields) => {
                        Ok(Self {
                            #(
                                #field_idents: {
                                    let slot = fields.get(#field_names).ok_or_else(|| {
                                        ::constellation::error::ConstellationError::type_mismatch(
                                            <Self as ::constellation::value::ValueType>::type_of(),
                                            ::constellation::types::CType::Unit,
                                            format!("missing field `{}`", #field_names),
                                        )
                                    })?;
                                    ::constellation::value::ValueType::extract(slot)?
                                },
                            )*
                        })
                    }
                    other => Err(::constellation::error::ConstellationError::type_mismatch(
                        <Self as ::constellation::value::ValueType>::type_of(),
                        other.type_of(),
                        "expected a product value".to_string(),
                    )),
                }
            }
        }
    };

    expanded.into()
}

#[cfg(test)]
mod tests {
    // Compile-only sanity: the macro must at least parse. Behavioral tests
    // live in `constellation`'s own test suite, which can depend on this
    // crate without a cycle.
    #[test]
    fn crate_compiles() {
        assert_eq!(2 + 2, 4);
    }
}
