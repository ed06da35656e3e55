use syn::punctuated::Punctuated;
use syn::spanned::Spanned;
use syn::{Attribute, Expr, Lit, Meta, Result as SynResult, Token};

/// 解析后的 `#[handler]` / `#[handler(veto)]` / `#[handler(veto = bool)]`
pub(crate) struct HandlerAttr {
    pub(crate) veto: bool,
}

// 从方法上移除 #[handler]，其余属性保持原有顺序
pub(crate) fn take_handler_attr(attrs: &mut Vec<Attribute>) -> SynResult<Option<HandlerAttr>> {
    let mut found: Option<HandlerAttr> = None;
    let mut retained = Vec::with_capacity(attrs.len());

    for attr in attrs.drain(..) {
        if !attr.path().is_ident("handler") {
            retained.push(attr);
            continue;
        }
        if found.is_some() {
            return Err(syn::Error::new(
                attr.span(),
                "duplicate #[handler] attribute on this method",
            ));
        }
        found = Some(parse_handler_attr(&attr)?);
    }

    *attrs = retained;
    Ok(found)
}

fn parse_handler_attr(attr: &Attribute) -> SynResult<HandlerAttr> {
    match &attr.meta {
        Meta::Path(_) => Ok(HandlerAttr { veto: false }),
        Meta::List(_) => {
            let mut veto: Option<bool> = None;
            let metas = attr.parse_args_with(Punctuated::<Meta, Token![,]>::parse_terminated)?;

            for meta in metas {
                let value = match &meta {
                    Meta::Path(p) if p.is_ident("veto") => true,
                    Meta::NameValue(nv) if nv.path.is_ident("veto") => match &nv.value {
                        Expr::Lit(syn::ExprLit {
                            lit: Lit::Bool(b), ..
                        }) => b.value,
                        other => {
                            return Err(syn::Error::new(
                                other.span(),
                                "expected boolean literal for 'veto'",
                            ));
                        }
                    },
                    other => {
                        return Err(syn::Error::new(
                            other.span(),
                            "unknown key; expected 'veto'",
                        ));
                    }
                };
                if veto.is_some() {
                    return Err(syn::Error::new(
                        meta.span(),
                        "duplicate key 'veto' in attribute",
                    ));
                }
                veto = Some(value);
            }

            Ok(HandlerAttr {
                veto: veto.unwrap_or(false),
            })
        }
        other => Err(syn::Error::new(
            other.span(),
            "expected #[handler] or #[handler(veto)]",
        )),
    }
}
