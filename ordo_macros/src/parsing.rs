//! Attribute parsing for `#[derive(FlowType)]`.

use syn::meta::ParseNestedMeta;
use syn::punctuated::Punctuated;
use syn::{Data, DeriveInput, Fields, Ident, LitStr, Meta, Path, Token, Type};

/// What the derive reads off the annotated struct.
pub(crate) struct FlowTypeArgs {
    /// Explicit type id from `#[flow_type(id = "...")]`
    pub type_id: Option<LitStr>,
    /// Activity types from `#[flow_type(activities(...))]`
    pub activities: Vec<Path>,
    /// Child-flow output from `#[invokable(output = T)]`
    pub output: Option<Type>,
    /// Field access chain of the business key, starting at the marked field
    pub business_key: Vec<Ident>,
}

impl FlowTypeArgs {
    pub fn from_input(input: &DeriveInput) -> syn::Result<Self> {
        let mut args = Self {
            type_id: None,
            activities: Vec::new(),
            output: None,
            business_key: business_key_path(input)?,
        };

        for attr in &input.attrs {
            if attr.path().is_ident("flow_type") {
                attr.parse_nested_meta(|meta| args.parse_flow_type(meta))?;
            } else if attr.path().is_ident("invokable") {
                attr.parse_nested_meta(|meta| args.parse_invokable(meta))?;
            }
        }
        Ok(args)
    }

    fn parse_flow_type(&mut self, meta: ParseNestedMeta) -> syn::Result<()> {
        if meta.path.is_ident("id") {
            let id: LitStr = meta.value()?.parse()?;
            if id.value().is_empty() {
                return Err(syn::Error::new_spanned(id, "flow type id must not be empty"));
            }
            self.type_id = Some(id);
            Ok(())
        } else if meta.path.is_ident("activities") {
            meta.parse_nested_meta(|activity| {
                self.activities.push(activity.path);
                Ok(())
            })
        } else {
            Err(meta.error("expected `id = \"...\"` or `activities(...)`"))
        }
    }

    fn parse_invokable(&mut self, meta: ParseNestedMeta) -> syn::Result<()> {
        if meta.path.is_ident("output") {
            self.output = Some(meta.value()?.parse()?);
            Ok(())
        } else {
            Err(meta.error("expected `output = Type`"))
        }
    }
}

/// Finds the single `#[business_key]` field and its optional nested path.
fn business_key_path(input: &DeriveInput) -> syn::Result<Vec<Ident>> {
    let Data::Struct(data) = &input.data else {
        return Err(syn::Error::new_spanned(
            &input.ident,
            "FlowType can only be derived for structs",
        ));
    };
    let Fields::Named(fields) = &data.fields else {
        return Err(syn::Error::new_spanned(
            &input.ident,
            "FlowType needs a struct with named fields",
        ));
    };

    let mut found: Option<Vec<Ident>> = None;
    for field in &fields.named {
        let Some(ident) = &field.ident else { continue };
        for attr in field.attrs.iter().filter(|a| a.path().is_ident("business_key")) {
            if found.is_some() {
                return Err(syn::Error::new_spanned(
                    attr,
                    "only one field can be marked #[business_key]",
                ));
            }
            let mut path = vec![ident.clone()];
            if let Meta::List(_) = &attr.meta {
                let nested = attr
                    .parse_args_with(Punctuated::<Ident, Token![.]>::parse_separated_nonempty)?;
                path.extend(nested);
            }
            found = Some(path);
        }
    }

    found.ok_or_else(|| {
        syn::Error::new_spanned(
            &input.ident,
            "FlowType needs one field marked #[business_key]",
        )
    })
}
