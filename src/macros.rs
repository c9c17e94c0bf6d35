#[macro_export]
macro_rules! tree {
    ($e:expr) => {{
        use $crate::tree::tree_parser::from_newick;
        from_newick($e).unwrap().pop().unwrap()
    }};
}

#[macro_export]
macro_rules! param {
    ($id:expr, $values:expr) => {{
        use $crate::parameter::Parameter;
        Parameter::new($id, $values.to_vec()).handle()
    }};
    ($id:expr, $values:expr, $lower:expr, $upper:expr) => {{
        use $crate::parameter::Parameter;
        Parameter::with_bounds($id, $values.to_vec(), $lower, $upper)
            .unwrap()
            .handle()
    }};
}
