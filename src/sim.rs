// The registered-object system the interpreter binds field and method
// opcodes against.
//
// This is the minimal engine-side surface: classes are data (a ClassRep
// with fn-pointer hooks for constructor arguments and datablock preload),
// objects are records with a dynamic string-field dictionary, typed static
// field storage, permission flags, and group membership. The registry
// resolves names, ids, and slash paths, and owns the root and datablock
// groups.

use enumflags2::BitFlags;
use std::collections::HashMap;
use std::rc::Rc;

use crate::ident::{Ident, IdentTable};
use crate::namespace::{Namespaces, NsId};
use crate::util::parse_int;


pub type ObjectId = u32;

#[derive(BitFlags, Copy, Clone, Debug, PartialEq)]
#[repr(u8)]
pub enum ObjectFlag {
    ModStaticFields  = 0b00001,
    ModDynamicFields = 0b00010,
    Added            = 0b00100,
    IsGroup          = 0b01000,
    IsSet            = 0b10000,
}

pub struct FieldSpec {
    pub name: Ident,
    pub elem_count: u32,
}

pub type ProcessArguments = fn(&mut SimObject, &[String]) -> bool;
pub type Preload = fn(&mut SimObject) -> Result<(), String>;

pub fn default_process_arguments(_object: &mut SimObject, args: &[String]) -> bool {
    args.is_empty()
}

pub fn default_preload(_object: &mut SimObject) -> Result<(), String> {
    Ok(())
}

pub struct ClassRep {
    pub name: String,
    pub namespace: NsId,
    pub is_datablock: bool,
    pub is_group: bool,
    pub is_set: bool,
    pub fields: Vec<FieldSpec>,
    pub process_arguments: ProcessArguments,
    pub preload: Preload,
}

impl ClassRep {
    pub fn new(name: &str, namespace: NsId) -> ClassRep {
        ClassRep {
            name: name.to_string(),
            namespace,
            is_datablock: false,
            is_group: false,
            is_set: false,
            fields: Vec::new(),
            process_arguments: default_process_arguments,
            preload: default_preload,
        }
    }

    pub fn find_field(&self, name: Ident) -> Option<&FieldSpec> {
        self.fields.iter().find(|f| f.name == name)
    }
}


pub struct SimObject {
    pub id: ObjectId,
    pub name: Option<String>,
    pub class: Rc<ClassRep>,
    pub flags: BitFlags<ObjectFlag>,
    pub group: Option<ObjectId>,
    pub members: Vec<ObjectId>,
    dynamic: HashMap<String, String>,
    statics: HashMap<Ident, Vec<String>>,
}

impl SimObject {
    pub fn class_name(&self) -> &str {
        &self.class.name
    }

    pub fn namespace(&self) -> NsId {
        self.class.namespace
    }

    pub fn is_datablock(&self) -> bool {
        self.class.is_datablock
    }

    pub fn is_properly_added(&self) -> bool {
        self.flags.contains(ObjectFlag::Added)
    }

    fn dynamic_key(&self, idents: &IdentTable, field: Ident, array: &str) -> String {
        let mut key = idents.resolve(field).to_ascii_lowercase();
        key.push_str(&array.to_ascii_lowercase());
        key
    }

    // element index per the field opcodes: an empty suffix means "the whole
    // field", which is element zero only for single-element fields
    fn element_index(spec: &FieldSpec, array: &str) -> Option<usize> {
        let index: i64 = if array.is_empty() { -1 } else { parse_int(array) as i64 };
        if index == -1 && spec.elem_count == 1 {
            Some(0)
        } else if index >= 0 && (index as u32) < spec.elem_count {
            Some(index as usize)
        } else {
            None
        }
    }

    pub fn get_data_field(&self, idents: &IdentTable, field: Ident, array: &str) -> String {
        if self.flags.contains(ObjectFlag::ModStaticFields) {
            if let Some(spec) = self.class.find_field(field) {
                return match Self::element_index(spec, array) {
                    Some(index) => self
                        .statics
                        .get(&field)
                        .and_then(|values| values.get(index))
                        .cloned()
                        .unwrap_or_default(),
                    None => String::new(),
                };
            }
        }
        if self.flags.contains(ObjectFlag::ModDynamicFields) {
            let key = self.dynamic_key(idents, field, array);
            if let Some(value) = self.dynamic.get(&key) {
                return value.clone();
            }
        }
        String::new()
    }

    pub fn set_data_field(&mut self, idents: &IdentTable, field: Ident, array: &str, value: &str) {
        if self.flags.contains(ObjectFlag::ModStaticFields) {
            if let Some(spec) = self.class.find_field(field) {
                let count = spec.elem_count as usize;
                if let Some(index) = Self::element_index(spec, array) {
                    let values = self
                        .statics
                        .entry(field)
                        .or_insert_with(|| vec![String::new(); count]);
                    values[index] = value.to_string();
                }
                return;
            }
        }
        if self.flags.contains(ObjectFlag::ModDynamicFields) {
            let key = self.dynamic_key(idents, field, array);
            if value.is_empty() {
                self.dynamic.remove(&key);
            } else {
                self.dynamic.insert(key, value.to_string());
            }
        }
    }
}


pub struct Sim {
    objects: HashMap<ObjectId, SimObject>,
    names: HashMap<String, ObjectId>,
    classes: HashMap<String, Rc<ClassRep>>,
    next_id: ObjectId,
    root_group: ObjectId,
    datablock_group: ObjectId,
}

impl Sim {
    pub fn new(idents: &mut IdentTable, namespaces: &mut Namespaces) -> Sim {
        let mut sim = Sim {
            objects: HashMap::new(),
            names: HashMap::new(),
            classes: HashMap::new(),
            next_id: 1,
            root_group: 0,
            datablock_group: 0,
        };

        let object_ns = namespaces.find(idents.intern("SimObject"));
        let set_ns = namespaces.find(idents.intern("SimSet"));
        let group_ns = namespaces.find(idents.intern("SimGroup"));
        let datablock_ns = namespaces.find(idents.intern("SimDataBlock"));
        namespaces.set_parent(set_ns, Some(object_ns));
        namespaces.set_parent(group_ns, Some(set_ns));
        namespaces.set_parent(datablock_ns, Some(object_ns));

        sim.register_class(ClassRep::new("SimObject", object_ns));
        let mut set = ClassRep::new("SimSet", set_ns);
        set.is_set = true;
        sim.register_class(set);
        let mut group = ClassRep::new("SimGroup", group_ns);
        group.is_group = true;
        group.is_set = true;
        let group = sim.register_class(group);
        let mut datablock = ClassRep::new("SimDataBlock", datablock_ns);
        datablock.is_datablock = true;
        sim.register_class(datablock);

        let root = sim.create_object(&group);
        sim.assign_name(root, "RootGroup");
        sim.root_group = root;
        let datablocks = sim.create_object(&group);
        sim.assign_name(datablocks, "DataBlockGroup");
        sim.datablock_group = datablocks;
        for id in [root, datablocks].iter() {
            sim.objects.get_mut(id).unwrap().flags.insert(ObjectFlag::Added);
        }
        sim
    }

    pub fn root_group(&self) -> ObjectId {
        self.root_group
    }

    pub fn datablock_group(&self) -> ObjectId {
        self.datablock_group
    }

    pub fn register_class(&mut self, class: ClassRep) -> Rc<ClassRep> {
        let key = class.name.to_ascii_lowercase();
        let class = Rc::new(class);
        self.classes.insert(key, Rc::clone(&class));
        class
    }

    pub fn find_class(&self, name: &str) -> Option<Rc<ClassRep>> {
        self.classes.get(&name.to_ascii_lowercase()).cloned()
    }

    // Instantiate an object of the class: the id is assigned now, the
    // Added flag only at registration.
    pub fn create_object(&mut self, class: &Rc<ClassRep>) -> ObjectId {
        let id = self.next_id;
        self.next_id += 1;
        let mut flags = BitFlags::empty();
        if class.is_group {
            flags.insert(ObjectFlag::IsGroup);
        }
        if class.is_set {
            flags.insert(ObjectFlag::IsSet);
        }
        if class.is_datablock {
            flags.insert(ObjectFlag::ModStaticFields);
            flags.insert(ObjectFlag::ModDynamicFields);
        }
        self.objects.insert(
            id,
            SimObject {
                id,
                name: None,
                class: Rc::clone(class),
                flags,
                group: None,
                members: Vec::new(),
                dynamic: HashMap::new(),
                statics: HashMap::new(),
            },
        );
        id
    }

    pub fn register_object(&mut self, id: ObjectId) -> bool {
        let is_datablock = match self.objects.get_mut(&id) {
            Some(object) => {
                object.flags.insert(ObjectFlag::Added);
                object.is_datablock()
            }
            None => return false,
        };
        if is_datablock {
            let group = self.datablock_group;
            self.add_to_group(group, id);
        }
        true
    }

    pub fn remove_object(&mut self, id: ObjectId) {
        if let Some(object) = self.objects.remove(&id) {
            if let Some(name) = object.name {
                self.names.remove(&name.to_ascii_lowercase());
            }
            if let Some(group) = object.group {
                if let Some(parent) = self.objects.get_mut(&group) {
                    parent.members.retain(|&m| m != id);
                }
            }
        }
    }

    pub fn assign_name(&mut self, id: ObjectId, name: &str) {
        let old = match self.objects.get_mut(&id) {
            Some(object) => object.name.take(),
            None => return,
        };
        if let Some(old) = old {
            self.names.remove(&old.to_ascii_lowercase());
        }
        if !name.is_empty() {
            self.names.insert(name.to_ascii_lowercase(), id);
            self.objects.get_mut(&id).unwrap().name = Some(name.to_string());
        }
    }

    pub fn assign_fields_from(&mut self, dst: ObjectId, src: ObjectId) {
        let (dynamic, statics) = match self.objects.get(&src) {
            Some(object) => (object.dynamic.clone(), object.statics.clone()),
            None => return,
        };
        if let Some(object) = self.objects.get_mut(&dst) {
            object.dynamic.extend(dynamic);
            object.statics.extend(statics);
        }
    }

    pub fn object(&self, id: ObjectId) -> Option<&SimObject> {
        self.objects.get(&id)
    }

    pub fn object_mut(&mut self, id: ObjectId) -> Option<&mut SimObject> {
        self.objects.get_mut(&id)
    }

    pub fn find_by_name(&self, name: &str) -> Option<ObjectId> {
        self.names.get(&name.to_ascii_lowercase()).copied()
    }

    // Resolve "name", "id", "/path", "id/path", "name/path".
    pub fn find_object(&self, spec: &str) -> Option<ObjectId> {
        if spec.is_empty() {
            return None;
        }
        if let Some(rest) = spec.strip_prefix('/') {
            return self.find_in(self.root_group, rest);
        }
        if spec.as_bytes()[0].is_ascii_digit() {
            let (head, rest) = match spec.find('/') {
                Some(at) => (&spec[..at], Some(&spec[at + 1..])),
                None => (spec, None),
            };
            let id = parse_int(head) as ObjectId;
            if !self.objects.contains_key(&id) {
                return None;
            }
            return match rest {
                None => Some(id),
                Some(rest) => self.find_in(id, rest),
            };
        }
        match spec.find('/') {
            None => self.find_by_name(spec),
            Some(at) => {
                let base = self.find_by_name(&spec[..at])?;
                self.find_in(base, &spec[at + 1..])
            }
        }
    }

    fn find_in(&self, container: ObjectId, path: &str) -> Option<ObjectId> {
        let mut current = container;
        for segment in path.split('/') {
            if segment.is_empty() {
                continue;
            }
            let members = &self.objects.get(&current)?.members;
            current = *members.iter().find(|&&m| {
                self.objects
                    .get(&m)
                    .and_then(|o| o.name.as_deref())
                    .map_or(false, |n| n.eq_ignore_ascii_case(segment))
            })?;
        }
        Some(current)
    }

    pub fn find_member(&self, container: ObjectId, name: &str) -> Option<ObjectId> {
        self.find_in(container, name)
    }

    pub fn is_group(&self, id: ObjectId) -> bool {
        self.object(id).map_or(false, |o| o.flags.contains(ObjectFlag::IsGroup))
    }

    pub fn is_set(&self, id: ObjectId) -> bool {
        self.object(id).map_or(false, |o| o.flags.contains(ObjectFlag::IsSet))
    }

    pub fn add_to_group(&mut self, group: ObjectId, id: ObjectId) {
        let old = match self.objects.get_mut(&id) {
            Some(object) => object.group.replace(group),
            None => return,
        };
        if let Some(old) = old {
            if let Some(parent) = self.objects.get_mut(&old) {
                parent.members.retain(|&m| m != id);
            }
        }
        if let Some(parent) = self.objects.get_mut(&group) {
            if !parent.members.contains(&id) {
                parent.members.push(id);
            }
        }
    }

    // Set membership does not reparent.
    pub fn add_to_set(&mut self, set: ObjectId, id: ObjectId) {
        if let Some(parent) = self.objects.get_mut(&set) {
            if !parent.members.contains(&id) {
                parent.members.push(id);
            }
        }
    }
}
