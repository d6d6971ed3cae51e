//! Derive macro for the `Entity` trait.

use convert_case::{Case, Casing};
use proc_macro2::{Span, TokenStream};
use proc_macro_crate::{crate_name, FoundCrate};
use quote::quote;
use syn::{
    meta::ParseNestedMeta, token, Attribute, Data, DeriveInput, Expr, Field, Fields, Ident,
    LitStr, Token,
};

/// The path of the `tarantool_data` crate in the scope invoking the macro.
fn crate_path() -> TokenStream {
    match crate_name("tarantool-data") {
        Ok(FoundCrate::Name(name)) => {
            let ident = Ident::new(&name, Span::call_site());
            quote!(::#ident)
        }
        _ => quote!(::tarantool_data),
    }
}

/// Derive an `Entity` instance for a struct.
pub fn derive(
    DeriveInput {
        ident,
        generics,
        data,
        attrs,
        ..
    }: DeriveInput,
) -> TokenStream {
    if !generics.params.is_empty() {
        panic!("Entity cannot be derived on generic types");
    }
    let Data::Struct(s) = data else {
        panic!("Entity can only be derived for structs");
    };
    let Fields::Named(fields) = s.fields else {
        panic!("Entity fields must be named");
    };

    let krate = crate_path();
    let container = ContainerAttrs::parse(&attrs);
    let space = container
        .space
        .unwrap_or_else(|| ident.to_string().to_lowercase());

    let fields = fields
        .named
        .iter()
        .map(|f| FieldInfo::parse(f, container.rename_all.as_deref()))
        .filter(|f| !f.skip)
        .collect::<Vec<_>>();

    // Names of stored fields. Flattened fields contribute the names of their key, if declared;
    // other flattened fields are opaque to us.
    let field_names = fields
        .iter()
        .flat_map(|f| match (&f.key, f.flatten) {
            (Some(key), true) => key.clone(),
            (_, true) => vec![],
            (_, false) => vec![f.name.clone()],
        })
        .collect::<Vec<_>>();

    let ids = fields.iter().filter(|f| f.id).collect::<Vec<_>>();
    let (id_ty, id_expr, id_fields) = match ids.as_slice() {
        [] => panic!("Entity requires a field marked #[entity(id)]"),
        [id] => {
            let ident = &id.ident;
            let ty = &id.ty;
            let names = id.key.clone().unwrap_or_else(|| vec![id.name.clone()]);
            (
                quote!(#ty),
                quote!(::core::clone::Clone::clone(&self.#ident)),
                names,
            )
        }
        ids => {
            if ids.iter().any(|id| id.key.is_some()) {
                panic!("an embedded key cannot be combined with other id fields");
            }
            let idents = ids.iter().map(|id| &id.ident);
            let tys = ids.iter().map(|id| &id.ty);
            (
                quote!((#(#tys),*)),
                quote!((#(::core::clone::Clone::clone(&self.#idents)),*)),
                ids.iter().map(|id| id.name.clone()).collect(),
            )
        }
    };

    let version = fields.iter().find(|f| f.version).map(|f| {
        let ident = &f.ident;
        quote! {
            fn version(&self) -> ::core::option::Option<#krate::Value> {
                ::core::option::Option::Some(
                    #krate::private::to_writable(&self.#ident).unwrap_or(#krate::Value::Nil),
                )
            }
        }
    });

    quote! {
        impl #krate::mapping::Entity for #ident {
            type Id = #id_ty;

            fn space() -> &'static str {
                #space
            }

            fn id_fields() -> &'static [&'static str] {
                &[#(#id_fields),*]
            }

            fn fields() -> &'static [&'static str] {
                &[#(#field_names),*]
            }

            fn id(&self) -> Self::Id {
                #id_expr
            }

            #version
        }
    }
}

/// Struct-level attributes.
#[derive(Default)]
struct ContainerAttrs {
    space: Option<String>,
    rename_all: Option<String>,
}

impl ContainerAttrs {
    fn parse(attrs: &[Attribute]) -> Self {
        let mut parsed = Self::default();
        for attr in attrs {
            if attr.path().is_ident("entity") {
                attr.parse_nested_meta(|meta| {
                    if meta.path.is_ident("space") {
                        parsed.space = Some(meta.value()?.parse::<LitStr>()?.value());
                        Ok(())
                    } else {
                        Err(meta.error("unsupported entity attribute"))
                    }
                })
                .unwrap_or_else(|err| panic!("{err}"));
            } else if attr.path().is_ident("serde") {
                let _ = attr.parse_nested_meta(|meta| {
                    if meta.path.is_ident("rename_all") {
                        parsed.rename_all = Some(parse_serialize_name(&meta)?);
                        Ok(())
                    } else {
                        skip_meta_value(&meta)
                    }
                });
            }
        }
        parsed
    }
}

/// A field of the struct, with the attributes relevant to us.
struct FieldInfo {
    ident: Ident,
    ty: syn::Type,
    /// The name serde uses for this field.
    name: String,
    id: bool,
    key: Option<Vec<String>>,
    version: bool,
    skip: bool,
    flatten: bool,
}

impl FieldInfo {
    fn parse(field: &Field, rename_all: Option<&str>) -> Self {
        let ident = field.ident.clone().expect("named field");
        let mut info = Self {
            name: ident.to_string(),
            ident,
            ty: field.ty.clone(),
            id: false,
            key: None,
            version: false,
            skip: false,
            flatten: false,
        };
        let mut rename = None;

        for attr in &field.attrs {
            if attr.path().is_ident("entity") {
                attr.parse_nested_meta(|meta| {
                    if meta.path.is_ident("id") {
                        info.id = true;
                    } else if meta.path.is_ident("version") {
                        info.version = true;
                    } else if meta.path.is_ident("key") {
                        let key = meta.value()?.parse::<LitStr>()?.value();
                        info.key = Some(
                            key.split(',')
                                .map(|part| part.trim().to_string())
                                .filter(|part| !part.is_empty())
                                .collect(),
                        );
                    } else {
                        return Err(meta.error("unsupported entity attribute"));
                    }
                    Ok(())
                })
                .unwrap_or_else(|err| panic!("{err}"));
            } else if attr.path().is_ident("serde") {
                let _ = attr.parse_nested_meta(|meta| {
                    if meta.path.is_ident("rename") {
                        rename = Some(parse_serialize_name(&meta)?);
                        Ok(())
                    } else if meta.path.is_ident("skip") || meta.path.is_ident("skip_serializing")
                    {
                        info.skip = true;
                        Ok(())
                    } else if meta.path.is_ident("flatten") {
                        info.flatten = true;
                        Ok(())
                    } else {
                        skip_meta_value(&meta)
                    }
                });
            }
        }

        if info.key.is_some() && !info.id {
            panic!("`key` is only allowed on an id field");
        }
        info.name = match (rename, rename_all) {
            (Some(name), _) => name,
            (None, Some(rule)) => apply_rename_rule(&info.name, rule),
            (None, None) => info.name,
        };
        info
    }
}

/// Parse the serialization name from `rename = "..."` or `rename(serialize = "...")`.
fn parse_serialize_name(meta: &ParseNestedMeta) -> syn::Result<String> {
    if meta.input.peek(Token![=]) {
        return Ok(meta.value()?.parse::<LitStr>()?.value());
    }
    let mut name = None;
    meta.parse_nested_meta(|inner| {
        if inner.path.is_ident("serialize") {
            name = Some(inner.value()?.parse::<LitStr>()?.value());
            Ok(())
        } else {
            skip_meta_value(&inner)
        }
    })?;
    name.ok_or_else(|| meta.error("expected a serialization name"))
}

/// Consume the value of an attribute we do not care about.
fn skip_meta_value(meta: &ParseNestedMeta) -> syn::Result<()> {
    if meta.input.peek(Token![=]) {
        meta.value()?.parse::<Expr>()?;
    } else if meta.input.peek(token::Paren) {
        meta.parse_nested_meta(|inner| skip_meta_value(&inner))?;
    }
    Ok(())
}

/// Apply a serde `rename_all` rule to a field name.
fn apply_rename_rule(name: &str, rule: &str) -> String {
    match rule {
        "lowercase" => name.to_lowercase(),
        "UPPERCASE" => name.to_uppercase(),
        "PascalCase" => name.to_case(Case::Pascal),
        "camelCase" => name.to_case(Case::Camel),
        "snake_case" => name.to_case(Case::Snake),
        "SCREAMING_SNAKE_CASE" => name.to_case(Case::UpperSnake),
        "kebab-case" => name.to_case(Case::Kebab),
        "SCREAMING-KEBAB-CASE" => name.to_case(Case::Cobol),
        other => panic!("unsupported rename rule {other}"),
    }
}
