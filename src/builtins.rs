// Core host console functions.
//
// A handful of engine-side builtins, registered through the same host-entry
// path any game code would use. Between them they cover every callback
// return shape the dispatcher knows.

use crate::console::Channel;
use crate::interp::Interp;
use crate::namespace::HostFn;
use crate::sim::ObjectId;


fn echo(interp: &mut Interp, _this: Option<ObjectId>, argv: &[String]) {
    let message = argv[1..].concat();
    interp.printf(Channel::General, &message);
}

fn get_name(interp: &mut Interp, this: Option<ObjectId>, _argv: &[String]) -> String {
    this.and_then(|id| interp.sim.object(id))
        .and_then(|object| object.name.clone())
        .unwrap_or_default()
}

fn set_name(interp: &mut Interp, this: Option<ObjectId>, argv: &[String]) {
    if let (Some(id), Some(name)) = (this, argv.get(2)) {
        interp.sim.assign_name(id, name);
    }
}

fn get_id(_interp: &mut Interp, this: Option<ObjectId>, _argv: &[String]) -> i32 {
    this.map_or(0, |id| id as i32)
}

fn is_object(interp: &mut Interp, _this: Option<ObjectId>, argv: &[String]) -> bool {
    argv.get(1).map_or(false, |spec| interp.sim.find_object(spec).is_some())
}

pub fn register_core_builtins(interp: &mut Interp) {
    let global = interp.namespaces.global();
    let echo_name = interp.idents.intern("echo");
    interp
        .namespaces
        .add_host_function(global, echo_name, HostFn::Void(echo), 2, 0, "echo(text, ...)");
    let is_object_name = interp.idents.intern("isObject");
    interp.namespaces.add_host_function(
        global,
        is_object_name,
        HostFn::Bool(is_object),
        2,
        2,
        "isObject(object)",
    );

    let sim_object = interp.idents.intern("SimObject");
    let object_ns = interp.namespaces.find(sim_object);
    let get_name_name = interp.idents.intern("getName");
    interp.namespaces.add_host_function(
        object_ns,
        get_name_name,
        HostFn::Str(get_name),
        2,
        2,
        "object.getName()",
    );
    let set_name_name = interp.idents.intern("setName");
    interp.namespaces.add_host_function(
        object_ns,
        set_name_name,
        HostFn::Void(set_name),
        3,
        3,
        "object.setName(newName)",
    );
    let get_id_name = interp.idents.intern("getId");
    interp.namespaces.add_host_function(
        object_ns,
        get_id_name,
        HostFn::Int(get_id),
        2,
        2,
        "object.getId()",
    );
}
