// SPDX-License-Identifier: MPL-2.0

//! The derive macro implementation for `int_to_c_enum::TryFromInt`.

use proc_macro::TokenStream;
use quote::quote;
use syn::{parse_macro_input, Data, DeriveInput, Fields};

#[proc_macro_derive(TryFromInt)]
pub fn derive_try_from_int(input: TokenStream) -> TokenStream {
    let input = parse_macro_input!(input as DeriveInput);
    let name = &input.ident;

    let repr_ty = repr_type(&input).unwrap_or_else(|| syn::parse_str("isize").unwrap());

    let data = match &input.data {
        Data::Enum(data) => data,
        _ => {
            return syn::Error::new_spanned(&input, "TryFromInt can only be derived for enums")
                .to_compile_error()
                .into()
        }
    };

    let mut arms = Vec::new();
    for variant in &data.variants {
        if !matches!(variant.fields, Fields::Unit) {
            return syn::Error::new_spanned(
                variant,
                "TryFromInt requires every variant to be fieldless",
            )
            .to_compile_error()
            .into();
        }
        let variant_ident = &variant.ident;
        arms.push(quote! {
            x if x == #name::#variant_ident as #repr_ty => Ok(#name::#variant_ident),
        });
    }

    let expanded = quote! {
        impl ::core::convert::TryFrom<#repr_ty> for #name {
            type Error = ::int_to_c_enum::TryFromIntError;

            fn try_from(value: #repr_ty) -> ::core::result::Result<Self, Self::Error> {
                match value {
                    #(#arms)*
                    _ => Err(::int_to_c_enum::TryFromIntError::new()),
                }
            }
        }
    };

    expanded.into()
}

/// Extracts the integer type named by the item's `#[repr(..)]` attribute, if any.
fn repr_type(input: &DeriveInput) -> Option<syn::Type> {
    for attr in &input.attrs {
        if !attr.path().is_ident("repr") {
            continue;
        }
        let mut found = None;
        let _ = attr.parse_nested_meta(|meta| {
            if let Some(ident) = meta.path.get_ident() {
                let name = ident.to_string();
                if matches!(
                    name.as_str(),
                    "u8" | "u16" | "u32" | "u64" | "usize" | "i8" | "i16" | "i32" | "i64" | "isize"
                ) {
                    found = syn::parse_str(&name).ok();
                }
            }
            Ok(())
        });
        if found.is_some() {
            return found;
        }
    }
    None
}
