//! Derive macros used by `trouble-l2cap` for its signalling packet types.
extern crate proc_macro;
use proc_macro::TokenStream;
use quote::quote;
use syn::{parse_quote, Data, DeriveInput, Fields};

/// Derives `FixedSize`, `Encode` and `Decode` for a struct made of fixed size fields.
///
/// Fields are laid out in declaration order, little endian, without padding.
#[proc_macro_derive(Codec)]
pub fn derive_codec_fn(item: TokenStream) -> TokenStream {
    let ast = syn::parse_macro_input!(item as DeriveInput);
    let name = &ast.ident;

    let Data::Struct(data_struct) = &ast.data else {
        return syn::Error::new_spanned(&ast.ident, "Codec can only be derived for structs")
            .to_compile_error()
            .into();
    };

    let Fields::Named(fields) = &data_struct.fields else {
        return syn::Error::new_spanned(&ast.ident, "Codec requires named fields")
            .to_compile_error()
            .into();
    };

    let mut offsets = Vec::new();
    let mut field_constants: Vec<_> = Vec::new();
    let mut field_encoders: Vec<_> = Vec::new();
    let mut field_decoders: Vec<_> = Vec::new();

    for f in fields.named.iter() {
        let fname = &f.ident;
        let ftype = &f.ty;
        let fsize = quote! { <#ftype as crate::codec::FixedSize>::SIZE };

        let offset: syn::Expr = if offsets.is_empty() {
            parse_quote! {
                0
            }
        } else {
            parse_quote! {
                #(#offsets)+*
            }
        };
        offsets.push(fsize.clone());

        field_encoders.push(quote! {
            if #offset + #fsize <= dest.len() {
                crate::codec::Encode::encode(&self.#fname, &mut dest[#offset..#offset + #fsize])?;
            } else {
                return Err(crate::codec::Error::InsufficientSpace);
            }
        });

        field_decoders.push(quote! {
            #fname: if #offset + #fsize <= src.len() {
                <#ftype as crate::codec::Decode<'d>>::decode(&src[#offset..#offset + #fsize])?
            } else {
                return Err(crate::codec::Error::InsufficientSpace);
            },
        });

        field_constants.push(fsize);
    }

    quote! {
        impl crate::codec::FixedSize for #name {
            const SIZE: usize = #(#field_constants)+*;
        }

        impl crate::codec::Encode for #name {
            fn encode(&self, dest: &mut [u8]) -> Result<(), crate::codec::Error> {
                #(#field_encoders)*
                Ok(())
            }
        }

        impl<'d> crate::codec::Decode<'d> for #name {
            fn decode(src: &'d [u8]) -> Result<Self, crate::codec::Error> {
                Ok(Self {
                    #(#field_decoders)*
                })
            }
        }
    }
    .into()
}
