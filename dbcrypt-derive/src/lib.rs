//! Derive macros for `dbcrypt`.
//!
//! `#[derive(EncryptedModel)]` implements `dbcrypt::model::EncryptedModel`
//! for a struct with named fields.

#![warn(clippy::pedantic, clippy::nursery)]

use proc_macro::TokenStream;
use proc_macro2::{Span, TokenStream as TokenStream2};
use quote::quote;
use syn::{parse_macro_input, Data, DeriveInput, Fields, Ident, LitStr};

/// Derive macro for `EncryptedModel`.
///
/// Container attribute:
/// - `#[dbcrypt(table = "...")]`: host table name. Defaults to the snake
///   case struct name with an `s` appended.
///
/// Field attributes:
/// - `#[dbcrypt(key)]`: the primary key field. Its type must implement
///   `dbcrypt::record::ToObjectId` (integers, `Uuid`, 36-character `String`,
///   or `Option` of those).
/// - `#[dbcrypt(encrypted)]`: an encrypted attribute. The field must be an
///   `Option<String>`. `#[dbcrypt(encrypted, name = "...")]` overrides the
///   attribute name stored in the side table.
///
/// # Example
///
/// ```rust,ignore
/// use dbcrypt_derive::EncryptedModel;
///
/// #[derive(EncryptedModel)]
/// #[dbcrypt(table = "users")]
/// struct User {
///     #[dbcrypt(key)]
///     id: Option<u64>,
///     name: String,
///     #[dbcrypt(encrypted)]
///     ssn: Option<String>,
/// }
/// ```
#[proc_macro_derive(EncryptedModel, attributes(dbcrypt))]
pub fn derive_encrypted_model(input: TokenStream) -> TokenStream {
    let input = parse_macro_input!(input as DeriveInput);
    expand(&input).unwrap_or_else(syn::Error::into_compile_error).into()
}

struct EncryptedField {
    ident: Ident,
    name: String,
}

fn expand(input: &DeriveInput) -> syn::Result<TokenStream2> {
    let ident = &input.ident;
    let fields = match &input.data {
        Data::Struct(data) => match &data.fields {
            Fields::Named(fields) => &fields.named,
            _ => {
                return Err(syn::Error::new_spanned(
                    ident,
                    "EncryptedModel requires a struct with named fields",
                ))
            }
        },
        _ => {
            return Err(syn::Error::new_spanned(
                ident,
                "EncryptedModel can only be derived for structs",
            ))
        }
    };

    let mut table = None;
    for attr in input.attrs.iter().filter(|a| a.path().is_ident("dbcrypt")) {
        attr.parse_nested_meta(|meta| {
            if meta.path.is_ident("table") {
                let lit: LitStr = meta.value()?.parse()?;
                table = Some(lit.value());
                Ok(())
            } else {
                Err(meta.error("unsupported dbcrypt container attribute"))
            }
        })?;
    }
    let table = table.unwrap_or_else(|| default_table(&ident.to_string()));

    let mut key: Option<Ident> = None;
    let mut encrypted = Vec::new();
    for field in fields {
        let Some(field_ident) = field.ident.clone() else { continue };
        for attr in field.attrs.iter().filter(|a| a.path().is_ident("dbcrypt")) {
            let mut is_key = false;
            let mut is_encrypted = false;
            let mut name = None;
            attr.parse_nested_meta(|meta| {
                if meta.path.is_ident("key") {
                    is_key = true;
                    Ok(())
                } else if meta.path.is_ident("encrypted") {
                    is_encrypted = true;
                    Ok(())
                } else if meta.path.is_ident("name") {
                    let lit: LitStr = meta.value()?.parse()?;
                    name = Some(lit.value());
                    Ok(())
                } else {
                    Err(meta.error("unsupported dbcrypt field attribute"))
                }
            })?;

            if is_key {
                if key.is_some() {
                    return Err(syn::Error::new_spanned(
                        attr,
                        "only one field may be #[dbcrypt(key)]",
                    ));
                }
                key = Some(field_ident.clone());
            }
            if is_encrypted {
                let name = name.unwrap_or_else(|| field_ident.to_string());
                if encrypted.iter().any(|f: &EncryptedField| f.name == name) {
                    return Err(syn::Error::new_spanned(
                        attr,
                        format!("duplicate encrypted attribute '{name}'"),
                    ));
                }
                encrypted.push(EncryptedField { ident: field_ident.clone(), name });
            } else if name.is_some() {
                return Err(syn::Error::new_spanned(
                    attr,
                    "`name` is only valid on encrypted fields",
                ));
            }
        }
    }

    let key = key.ok_or_else(|| {
        syn::Error::new(
            Span::call_site(),
            "EncryptedModel requires one field marked #[dbcrypt(key)]",
        )
    })?;

    let names: Vec<&str> = encrypted.iter().map(|f| f.name.as_str()).collect();
    let idents: Vec<&Ident> = encrypted.iter().map(|f| &f.ident).collect();
    let (impl_generics, ty_generics, where_clause) = input.generics.split_for_impl();

    Ok(quote! {
        impl #impl_generics ::dbcrypt::model::EncryptedModel for #ident #ty_generics #where_clause {
            const TABLE: &'static str = #table;
            const ENCRYPTED_ATTRIBUTES: &'static [&'static str] = &[#(#names),*];

            fn object_id(&self) -> ::core::option::Option<::dbcrypt::record::ObjectId> {
                ::dbcrypt::record::ToObjectId::to_object_id(&self.#key)
            }

            fn get_attribute(&self, name: &str) -> ::core::option::Option<&str> {
                match name {
                    #(#names => self.#idents.as_deref(),)*
                    _ => ::core::option::Option::None,
                }
            }

            fn set_attribute(
                &mut self,
                name: &str,
                value: ::core::option::Option<::std::string::String>,
            ) {
                match name {
                    #(#names => self.#idents = value,)*
                    _ => {}
                }
            }
        }
    })
}

/// `UserProfile` becomes `user_profiles`.
fn default_table(type_name: &str) -> String {
    let mut table = String::with_capacity(type_name.len() + 4);
    for (i, c) in type_name.chars().enumerate() {
        if c.is_uppercase() {
            if i > 0 {
                table.push('_');
            }
            table.extend(c.to_lowercase());
        } else {
            table.push(c);
        }
    }
    table.push('s');
    table
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_table() {
        assert_eq!(default_table("User"), "users");
        assert_eq!(default_table("UserProfile"), "user_profiles");
    }

    #[test]
    fn test_expand_generates_impl() {
        let input: DeriveInput = syn::parse_quote! {
            #[dbcrypt(table = "people")]
            struct Person {
                #[dbcrypt(key)]
                id: u64,
                #[dbcrypt(encrypted)]
                ssn: Option<String>,
                #[dbcrypt(encrypted, name = "card")]
                credit_card: Option<String>,
            }
        };
        let output = expand(&input).unwrap().to_string();
        assert!(output.contains("\"people\""));
        assert!(output.contains("\"ssn\""));
        assert!(output.contains("\"card\""));
        assert!(output.contains("credit_card"));
    }

    #[test]
    fn test_expand_requires_key() {
        let input: DeriveInput = syn::parse_quote! {
            struct Person {
                #[dbcrypt(encrypted)]
                ssn: Option<String>,
            }
        };
        assert!(expand(&input).is_err());
    }

    #[test]
    fn test_expand_rejects_enums() {
        let input: DeriveInput = syn::parse_quote! {
            enum Person { A, B }
        };
        assert!(expand(&input).is_err());
    }
}
