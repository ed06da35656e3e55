use crate::handler_attr::take_handler_attr;
use proc_macro::TokenStream;
use proc_macro2::TokenStream as TokenStream2;
use quote::quote;
use syn::spanned::Spanned;
use syn::{FnArg, ImplItem, ImplItemFn, Item, LitStr, Type, parse_macro_input};

/// #[subscriber] 实现
/// - 输入必须是固有 impl 块
/// - 每个 `#[handler]` 方法生成一个 `::vetobus::HandlerBinding<Self>`
/// - 原样输出 impl 块（仅移除标注），随后输出 `impl ::vetobus::Subscriber for SelfTy`
pub(crate) fn expand(attr: TokenStream, item: TokenStream) -> TokenStream {
    if !attr.is_empty() {
        return syn::Error::new(
            TokenStream2::from(attr).span(),
            "#[subscriber] takes no arguments",
        )
        .to_compile_error()
        .into();
    }

    let input = parse_macro_input!(item as Item);
    let mut item_impl = match input {
        Item::Impl(i) if i.trait_.is_none() => i,
        Item::Impl(i) => {
            return syn::Error::new(
                i.span(),
                "#[subscriber] only on inherent impl blocks, not trait impls",
            )
            .to_compile_error()
            .into();
        }
        other => {
            return syn::Error::new(other.span(), "#[subscriber] only on impl blocks")
                .to_compile_error()
                .into();
        }
    };

    let mut bindings: Vec<TokenStream2> = Vec::new();
    for impl_item in item_impl.items.iter_mut() {
        let ImplItem::Fn(method) = impl_item else {
            continue;
        };
        let cfg = match take_handler_attr(&mut method.attrs) {
            Ok(Some(cfg)) => cfg,
            Ok(None) => continue,
            Err(err) => return err.to_compile_error().into(),
        };
        match binding_for(method, cfg.veto) {
            Ok(tokens) => bindings.push(tokens),
            Err(err) => return err.to_compile_error().into(),
        }
    }

    let self_ty = &item_impl.self_ty;
    let (impl_generics, _, where_clause) = item_impl.generics.split_for_impl();

    let out = quote! {
        #item_impl

        impl #impl_generics ::vetobus::Subscriber for #self_ty #where_clause {
            fn handlers() -> ::std::vec::Vec<::vetobus::HandlerBinding<Self>> {
                ::std::vec![ #( #bindings ),* ]
            }
        }
    };

    TokenStream::from(out)
}

// 单个 #[handler] 方法 -> HandlerBinding 构造表达式
fn binding_for(method: &ImplItemFn, veto: bool) -> syn::Result<TokenStream2> {
    let sig = &method.sig;
    let ident = &sig.ident;
    let name = LitStr::new(&ident.to_string(), ident.span());

    if let Some(asyncness) = &sig.asyncness {
        return Err(syn::Error::new(
            asyncness.span(),
            "#[handler] methods are invoked on a blocking worker and cannot be async",
        ));
    }
    if !sig.generics.params.is_empty() {
        return Err(syn::Error::new(
            sig.generics.span(),
            "#[handler] methods cannot be generic",
        ));
    }

    let mut inputs = sig.inputs.iter();
    match inputs.next() {
        Some(FnArg::Receiver(r)) if r.reference.is_some() && r.mutability.is_none() => {}
        Some(FnArg::Receiver(r)) => {
            return Err(syn::Error::new(
                r.span(),
                "#[handler] methods must take `&self`",
            ));
        }
        _ => {
            return Err(syn::Error::new(
                sig.span(),
                "#[handler] methods must take `&self` as their first parameter",
            ));
        }
    }

    let params: Vec<&syn::PatType> = inputs
        .filter_map(|arg| match arg {
            FnArg::Typed(pt) => Some(pt),
            FnArg::Receiver(_) => None,
        })
        .collect();

    if params.len() != 1 {
        let arity = params.len();
        return Ok(quote! {
            ::vetobus::HandlerBinding::<Self>::with_arity(#name, #arity).veto_capable(#veto)
        });
    }

    let (message_ty, call_arg) = match params[0].ty.as_ref() {
        Type::Reference(r) if r.mutability.is_some() => {
            return Err(syn::Error::new(
                r.span(),
                "#[handler] message parameter cannot be `&mut`; take `&T` or `T`",
            ));
        }
        Type::Reference(r) => {
            let elem = r.elem.as_ref();
            (quote! { #elem }, quote! { message })
        }
        other => (
            quote! { #other },
            quote! { ::core::clone::Clone::clone(message) },
        ),
    };

    Ok(quote! {
        ::vetobus::HandlerBinding::<Self>::new::<#message_ty, _, _>(
            #name,
            |subscriber: &Self, message: &#message_ty| Self::#ident(subscriber, #call_arg),
        )
        .veto_capable(#veto)
    })
}
