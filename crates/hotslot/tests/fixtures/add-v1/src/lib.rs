//! Test plugin, first version

fn add(x: i32, y: i32) -> i32 {
    x + y
}

fn name_len(name: &str) -> usize {
    name.len()
}

hotslot::export_fn!(Add: fn(i32, i32) -> i32 = add, capabilities = ["Adder"]);
hotslot::export_fn!(Greet: fn(&str) -> usize = name_len);
hotslot::export_value!(V: i32 = 42);
hotslot::export_value!(Label: &'static str = "add-v1");
